//! Incremental byte-to-line decoding for the serial stream.

/// Longest line kept before it is flushed without a terminator.
const MAX_LINE_LEN: usize = 4096;

/// Decode as much UTF-8 as possible from `buffer`, leaving an incomplete
/// trailing sequence in place for the next read.
///
/// Invalid sequences become U+FFFD.
pub(crate) fn drain_utf8_lossy(buffer: &mut Vec<u8>) -> String {
    let mut output = String::new();

    loop {
        match std::str::from_utf8(buffer) {
            Ok(valid) => {
                output.push_str(valid);
                buffer.clear();
                break;
            },
            Err(err) => {
                let valid_up_to = err.valid_up_to();
                if valid_up_to > 0 {
                    if let Ok(valid) = std::str::from_utf8(&buffer[..valid_up_to]) {
                        output.push_str(valid);
                    }
                }

                match err.error_len() {
                    Some(invalid_len) => {
                        output.push('\u{FFFD}');
                        let drain_to = valid_up_to
                            .saturating_add(invalid_len)
                            .min(buffer.len());
                        buffer.drain(..drain_to);
                    },
                    None => {
                        if valid_up_to > 0 {
                            buffer.drain(..valid_up_to);
                        }
                        break;
                    },
                }
            },
        }
    }

    output
}

/// Splits a byte stream into trimmed, non-empty lines.
#[derive(Debug, Default)]
pub(crate) struct LineDecoder {
    raw: Vec<u8>,
    text: String,
}

impl LineDecoder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Feed received bytes and return every line they completed.
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.raw
            .extend_from_slice(bytes);
        let decoded = drain_utf8_lossy(&mut self.raw);
        self.text
            .push_str(&decoded);

        let mut lines = Vec::new();
        while let Some(pos) = self
            .text
            .find('\n')
        {
            let line: String = self
                .text
                .drain(..=pos)
                .collect();
            push_trimmed(&mut lines, &line);
        }
        if self
            .text
            .len()
            > MAX_LINE_LEN
        {
            let line = std::mem::take(&mut self.text);
            push_trimmed(&mut lines, &line);
        }
        lines
    }
}

fn push_trimmed(lines: &mut Vec<String>, line: &str) {
    let trimmed = line.trim();
    if !trimmed.is_empty() {
        lines.push(trimmed.to_string());
    }
}
