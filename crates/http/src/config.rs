//! Per-connection server settings.

/// Settings shared by every connection of a server.
///
/// ```
/// use micro_flux::config::ServerConfig;
///
/// let config = ServerConfig::default().max_frame_size(16 * 1024).date_header(false);
/// assert_eq!(config.get_max_frame_size(), 16 * 1024);
/// ```
#[derive(Debug, Clone)]
pub struct ServerConfig {
    read_buffer_size: usize,
    body_channel_depth: usize,
    max_frame_size: usize,
    date_header: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { read_buffer_size: 8 * 1024, body_channel_depth: 16, max_frame_size: 64 * 1024, date_header: true }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initial capacity of the socket read buffer.
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// How many request body chunks may wait for the handler before reading pauses.
    pub fn body_channel_depth(mut self, depth: usize) -> Self {
        self.body_channel_depth = depth;
        self
    }

    /// Bound of the aggregated websocket handshake body and of every inbound frame payload.
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Whether responses carry a `Date` header.
    pub fn date_header(mut self, enabled: bool) -> Self {
        self.date_header = enabled;
        self
    }

    pub fn get_read_buffer_size(&self) -> usize {
        self.read_buffer_size
    }

    pub fn get_body_channel_depth(&self) -> usize {
        self.body_channel_depth
    }

    pub fn get_max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    pub fn is_date_header(&self) -> bool {
        self.date_header
    }
}
