//! Audio output boundary used by the playback worker.

use anyhow::Result;

mod output;

pub use output::CpalSink;

/// Destination for raw interleaved bytes in the reader's output layout.
///
/// Writes are paced by the device: `write` blocks while the sink is full.
pub trait AudioSink {
    /// Bytes the worker hands over per `write` call.
    fn buffer_size(&self) -> usize;

    /// Queue `data` for output, returning the bytes consumed.
    fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Wait until queued audio has been played.
    fn drain(&mut self) -> Result<()> {
        Ok(())
    }
}
