//! SLIP framing (RFC 1055) for the serial transport.

const END: u8 = 0xC0;
const ESC: u8 = 0xDB;
const ESC_END: u8 = 0xDC;
const ESC_ESC: u8 = 0xDD;

/// Encode one frame, terminator included.
pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 1);
    for &b in data {
        match b {
            END => out.extend_from_slice(&[ESC, ESC_END]),
            ESC => out.extend_from_slice(&[ESC, ESC_ESC]),
            b => out.push(b),
        }
    }
    out.push(END);
    out
}

enum State {
    Decoding,
    Esc,
    /// An invalid escape poisons the rest of the frame; discard bytes
    /// until the next terminator and resynchronize there.
    SkipUntilEnd,
}

/// Byte-at-a-time SLIP decoder.
pub struct Decoder {
    state: State,
    frame: Vec<u8>,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            state: State::Decoding,
            frame: Vec::new(),
        }
    }

    /// Feed one byte; returns a complete frame when `byte` closes one.
    /// Empty frames (back-to-back END bytes) are swallowed.
    pub fn feed(&mut self, byte: u8) -> Option<Vec<u8>> {
        match self.state {
            State::Decoding => match byte {
                END => {
                    if self.frame.is_empty() {
                        return None;
                    }
                    return Some(std::mem::take(&mut self.frame));
                }
                ESC => self.state = State::Esc,
                b => self.frame.push(b),
            },
            State::Esc => match byte {
                ESC_END => {
                    self.frame.push(END);
                    self.state = State::Decoding;
                }
                ESC_ESC => {
                    self.frame.push(ESC);
                    self.state = State::Decoding;
                }
                _ => {
                    self.frame.clear();
                    self.state = State::SkipUntilEnd;
                }
            },
            State::SkipUntilEnd => {
                if byte == END {
                    self.state = State::Decoding;
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(decoder: &mut Decoder, bytes: &[u8]) -> Vec<Vec<u8>> {
        bytes.iter().filter_map(|&b| decoder.feed(b)).collect()
    }

    #[test]
    fn plain_roundtrip() {
        let frame = [0x60, 0x03, 0x01, 0x10, 0x20];
        let mut dec = Decoder::new();
        assert_eq!(decode_all(&mut dec, &encode(&frame)), vec![frame.to_vec()]);
    }

    #[test]
    fn special_bytes_are_escaped() {
        assert_eq!(encode(&[END]), vec![ESC, ESC_END, END]);
        assert_eq!(encode(&[ESC]), vec![ESC, ESC_ESC, END]);

        let frame = [END, ESC, 0x00, END];
        let mut dec = Decoder::new();
        assert_eq!(decode_all(&mut dec, &encode(&frame)), vec![frame.to_vec()]);
    }

    #[test]
    fn empty_frames_are_swallowed() {
        let mut dec = Decoder::new();
        assert_eq!(decode_all(&mut dec, &[END, END, END]), Vec::<Vec<u8>>::new());
    }

    #[test]
    fn invalid_escape_drops_frame_and_resyncs() {
        let mut dec = Decoder::new();
        // Frame poisoned by ESC followed by a non-escape byte, then a
        // clean frame right after.
        let mut stream = vec![0x01, 0x02, ESC, 0x55, 0x03, END];
        stream.extend(encode(&[0xAA, 0xBB]));
        assert_eq!(decode_all(&mut dec, &stream), vec![vec![0xAA, 0xBB]]);
    }

    #[test]
    fn frames_split_across_feeds() {
        let mut dec = Decoder::new();
        let encoded = encode(&[1, 2, 3]);
        let (a, b) = encoded.split_at(2);
        assert!(decode_all(&mut dec, a).is_empty());
        assert_eq!(decode_all(&mut dec, b), vec![vec![1, 2, 3]]);
    }
}
