//! Console dump sink.
//!
//! Prints, per PDU, the direction label, message type and size, followed by
//! a canonical hex dump of the raw bytes. CONNECT PDUs add one line of
//! decoded fields.

use std::fmt::Write as _;

use async_trait::async_trait;
use tokio::io::{self, AsyncWrite, AsyncWriteExt, Stdout};

use crate::error::SinkError;

use super::{PduObservation, PduSink};

/// Render `data` as offset, sixteen hex bytes in two groups of eight, and a
/// printable-ASCII gutter per line.
#[must_use]
pub fn hex_dump(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len().div_ceil(16) * 79);

    for (line, chunk) in data.chunks(16).enumerate() {
        let _ = write!(out, "{:08x}  ", line * 16);
        for i in 0..16 {
            match chunk.get(i) {
                Some(byte) => {
                    let _ = write!(out, "{byte:02x} ");
                }
                None => out.push_str("   "),
            }
            if i == 7 {
                out.push(' ');
            }
        }
        out.push_str(" |");
        out.extend(chunk.iter().map(|&b| {
            if (0x20..=0x7e).contains(&b) {
                b as char
            } else {
                '.'
            }
        }));
        out.push_str("|\n");
    }

    out
}

/// Writes a human-readable dump of every PDU.
///
/// Each PDU is rendered into one buffer and written with a single
/// `write_all`. Output is async, so a stalled stdout pipe parks the relay
/// task instead of a runtime worker.
pub struct ConsoleSink<W = Stdout> {
    out: W,
}

impl ConsoleSink<Stdout> {
    /// Console sink writing to the process's stdout.
    #[must_use]
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: AsyncWrite + Unpin + Send> ConsoleSink<W> {
    /// Console sink writing to `out`.
    pub fn new(out: W) -> Self {
        Self { out }
    }

    /// Consume the sink, returning the writer.
    pub fn into_inner(self) -> W {
        self.out
    }

    /// Render one observation as it would be printed.
    #[must_use]
    pub fn render(observation: &PduObservation<'_>) -> String {
        let label = observation.direction.label();
        let message_type = observation.decoded.message_type;
        let mut text = String::new();

        let _ = writeln!(
            text,
            "{label}: {message_type} ({} bytes)",
            observation.pdu.len()
        );
        text.push_str(&hex_dump(observation.pdu.as_bytes()));

        if let Some(connect) = &observation.decoded.connect {
            let _ = writeln!(text, "CONNECT: {connect}");
        }

        text
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> PduSink for ConsoleSink<W> {
    fn name(&self) -> &'static str {
        "console"
    }

    async fn accept(&mut self, observation: &PduObservation<'_>) -> Result<(), SinkError> {
        let text = Self::render(observation);
        self.out.write_all(text.as_bytes()).await?;
        self.out.flush().await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        self.out.flush().await?;
        Ok(())
    }
}
