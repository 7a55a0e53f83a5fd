use std::io::Write;

use indicatif::MultiProgress;
use tracing_subscriber::fmt::MakeWriter;

/// A tracing writer that hides the progress bars while a log line is
/// written to stderr.
#[derive(Clone)]
pub struct IndicatifWriter {
    progress_bars: MultiProgress,
}

impl IndicatifWriter {
    pub fn new(progress_bars: MultiProgress) -> Self {
        Self { progress_bars }
    }
}

impl Write for IndicatifWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.progress_bars
            .suspend(|| std::io::stderr().lock().write(buf))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.progress_bars.suspend(|| std::io::stderr().lock().flush())
    }
}

impl<'a> MakeWriter<'a> for IndicatifWriter {
    type Writer = IndicatifWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
