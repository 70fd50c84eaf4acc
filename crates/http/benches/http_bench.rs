use std::hint::black_box;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use criterion::{Criterion, criterion_group, criterion_main};
use http::{Response, StatusCode};
use micro_flux::codec::{FrameCodec, RequestDecoder, ResponseEncoder};
use micro_flux::connection::HttpConnection;
use micro_flux::handler::{HttpServerRequest, HttpServerResponse, make_handler};
use micro_flux::protocol::{Message, PayloadItem, PayloadSize, ResponseHead};
use micro_flux::reactive::{Unit, from_iter};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::runtime::Runtime;
use tokio_util::codec::{Decoder, Encoder};

fn bench_request_decoder(c: &mut Criterion) {
    let request = b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n";

    c.bench_function("decode_simple_request", |b| {
        b.iter(|| {
            let mut decoder = RequestDecoder::new();
            let mut bytes = BytesMut::from(&request[..]);
            black_box(decoder.decode(&mut bytes).unwrap());
        });
    });
}

fn bench_response_encoder(c: &mut Criterion) {
    c.bench_function("encode_chunked_response", |b| {
        b.iter(|| {
            let mut encoder = ResponseEncoder::new();
            let mut bytes = BytesMut::new();
            let head: ResponseHead = Response::new(());
            encoder.encode(Message::<_, Bytes>::Header((head, PayloadSize::Chunked)), &mut bytes).unwrap();
            for _ in 0..8 {
                let chunk = Message::<(ResponseHead, PayloadSize)>::Payload(PayloadItem::Chunk(Bytes::from_static(b"Hello World!")));
                encoder.encode(chunk, &mut bytes).unwrap();
            }
            encoder.encode(Message::<(ResponseHead, PayloadSize)>::Payload(PayloadItem::Eof), &mut bytes).unwrap();
            black_box(bytes);
        });
    });
}

fn bench_frame_codec(c: &mut Criterion) {
    // masked text frame "Hello" from RFC 6455 section 5.7
    let frame = [0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58];

    c.bench_function("decode_masked_frame", |b| {
        b.iter(|| {
            let mut codec = FrameCodec::new(64 * 1024);
            let mut bytes = BytesMut::from(&frame[..]);
            black_box(codec.decode(&mut bytes).unwrap());
        });
    });
}

fn bench_http_connection(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();
    let handler = Arc::new(make_handler(|_request: HttpServerRequest, response: &mut HttpServerResponse<'_>| {
        response.status(StatusCode::OK).unwrap();
        response.send_stream(from_iter([Unit::from("Hello "), Unit::from("World!")]))
    }));

    c.bench_function("process_keep_alive_requests", |b| {
        b.to_async(&runtime).iter(|| {
            let handler = Arc::clone(&handler);
            async move {
                let (mut client, server) = tokio::io::duplex(64 * 1024);
                let (reader, writer) = tokio::io::split(server);
                let connection = tokio::spawn(HttpConnection::new(reader, writer).process(handler));

                for _ in 0..3 {
                    client.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n").await.unwrap();
                }
                // the server closes after the last response
                client.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n").await.unwrap();
                let mut received = Vec::new();
                client.read_to_end(&mut received).await.unwrap();
                connection.await.unwrap().unwrap();
                black_box(received);
            }
        });
    });
}

criterion_group!(benches, bench_request_decoder, bench_response_encoder, bench_frame_codec, bench_http_connection);
criterion_main!(benches);
