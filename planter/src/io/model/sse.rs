//! Minimal blocking server-sent-events reader.

use std::io::BufRead;

/// Yields the `data` payload of each event; multi-line data is joined with `\n`.
///
/// Stops at end of stream or at a `[DONE]` sentinel. Comments and non-data
/// fields (`event:`, `id:`, `retry:`) are ignored.
pub struct SseReader<R> {
    reader: R,
    done: bool,
}

impl<R: BufRead> SseReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            done: false,
        }
    }
}

impl<R: BufRead> Iterator for SseReader<R> {
    type Item = std::io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut data: Option<String> = None;
        let mut line = String::new();
        loop {
            line.clear();
            let read = match self.reader.read_line(&mut line) {
                Ok(read) => read,
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            };
            if read == 0 {
                self.done = true;
                return data.filter(|d| d.trim() != "[DONE]").map(Ok);
            }

            let trimmed = line.trim_end_matches(['\r', '\n']);
            if trimmed.is_empty() {
                match data.take() {
                    Some(payload) if payload.trim() == "[DONE]" => {
                        self.done = true;
                        return None;
                    }
                    Some(payload) => return Some(Ok(payload)),
                    None => continue,
                }
            }
            if let Some(rest) = trimmed.strip_prefix("data:") {
                let rest = rest.strip_prefix(' ').unwrap_or(rest);
                match data.as_mut() {
                    Some(existing) => {
                        existing.push('\n');
                        existing.push_str(rest);
                    }
                    None => data = Some(rest.to_string()),
                }
            }
        }
    }
}
