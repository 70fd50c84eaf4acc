use std::collections::HashMap;

use http::{HeaderMap, header};

/// Request cookies, parsed once from the `Cookie` headers when the request head arrives.
#[derive(Debug, Clone, Default)]
pub struct Cookies {
    cached: HashMap<String, Vec<String>>,
}

impl Cookies {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut cached: HashMap<String, Vec<String>> = HashMap::new();
        for value in headers.get_all(header::COOKIE) {
            let Ok(value) = value.to_str() else {
                continue;
            };
            for pair in value.split(';') {
                let Some((name, value)) = pair.split_once('=') else {
                    continue;
                };
                let name = name.trim();
                if name.is_empty() {
                    continue;
                }
                let value = value.trim().trim_matches('"');
                cached.entry(name.to_owned()).or_default().push(value.to_owned());
            }
        }
        Self { cached }
    }

    /// First value of the named cookie.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.cached.get(name).and_then(|values| values.first()).map(String::as_str)
    }

    pub fn get_all(&self, name: &str) -> &[String] {
        self.cached.get(name).map_or(&[], Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.cached.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cached.is_empty()
    }
}
