//! NMEA sentence validation and stream assembly.

use tracing::debug;

use super::constants::{NMEA_CHECKSUM_DELIMITER, NMEA_GGA_TALKER, NMEA_START};
use super::frame::FrameError;

/// Longest line kept while waiting for a terminator.
const MAX_SENTENCE_LEN: usize = 128;

/// Verify an NMEA sentence checksum.
///
/// Framing characters (`$`, `\r`, `\n`) are stripped, the remainder is split
/// on `*`, and the body characters are XOR-reduced. Returns
/// `(expected, computed)`; the caller compares them.
pub fn checksum_verify(sentence: &str) -> Result<(u8, u8), FrameError> {
    let stripped: String = sentence
        .chars()
        .filter(|c| !matches!(c, '\r' | '\n' | '$'))
        .collect();

    let mut parts = stripped.split(NMEA_CHECKSUM_DELIMITER);
    let (Some(body), Some(checksum), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(FrameError::MalformedSentence(sentence.trim_end().to_string()));
    };

    let expected = u8::from_str_radix(checksum.trim(), 16)
        .map_err(|_| FrameError::MalformedSentence(sentence.trim_end().to_string()))?;
    let computed = body.bytes().fold(0u8, |acc, b| acc ^ b);
    Ok((expected, computed))
}

/// A sentence whose checksum matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NmeaSentence {
    text: String,
}

impl NmeaSentence {
    /// Sentence text without the trailing CR/LF.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Sentence as received, CR/LF included.
    pub fn line(&self) -> String {
        format!("{}\r\n", self.text)
    }

    pub fn is_gga(&self) -> bool {
        self.text.starts_with(NMEA_GGA_TALKER)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum LineState {
    #[default]
    Body,
    /// Saw `\r`, expecting `\n`.
    Carriage,
}

/// Byte-wise assembler turning a raw stream into validated sentences.
#[derive(Debug, Default)]
pub struct NmeaAssembler {
    buf: Vec<u8>,
    state: LineState,
    malformed: u64,
}

impl NmeaAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sentences dropped for a checksum or format failure.
    pub fn malformed(&self) -> u64 {
        self.malformed
    }

    fn restart(&mut self) {
        self.buf.clear();
        self.state = LineState::Body;
    }

    pub fn push(&mut self, data: &[u8]) -> Vec<NmeaSentence> {
        let mut sentences = Vec::new();

        for &byte in data {
            if byte == NMEA_START {
                self.restart();
                self.buf.push(byte);
                continue;
            }
            if self.buf.is_empty() {
                continue;
            }

            self.buf.push(byte);
            match self.state {
                LineState::Body => {
                    if byte == b'\r' {
                        self.state = LineState::Carriage;
                    } else if self.buf.len() > MAX_SENTENCE_LEN {
                        self.malformed += 1;
                        self.restart();
                    }
                }
                LineState::Carriage => {
                    if byte == b'\n' {
                        if let Some(sentence) = self.complete() {
                            sentences.push(sentence);
                        }
                    }
                    self.restart();
                }
            }
        }

        sentences
    }

    fn complete(&mut self) -> Option<NmeaSentence> {
        let line = String::from_utf8_lossy(&self.buf).into_owned();
        match checksum_verify(&line) {
            Ok((expected, computed)) if expected == computed => Some(NmeaSentence {
                text: line.trim_end_matches(['\r', '\n']).to_string(),
            }),
            Ok((expected, computed)) => {
                debug!(expected, computed, "NMEA checksum mismatch");
                self.malformed += 1;
                None
            }
            Err(e) => {
                debug!(error = %e, "Dropping NMEA line");
                self.malformed += 1;
                None
            }
        }
    }
}
