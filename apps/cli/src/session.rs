use std::io::Write;
use std::thread::{self, JoinHandle};

use pathcue_core::EventRx;
use iox::write_ndjson;
use tracing::warn;

/// Pump engine events to `out` as NDJSON on a blocking thread.
///
/// The thread ends once every sender is gone and returns how many events it
/// wrote.
pub fn pump_events<W: Write + Send + 'static>(rx: EventRx, mut out: W) -> JoinHandle<u64> {
    thread::spawn(move || {
        let mut written = 0u64;
        while let Ok(envelope) = rx.recv() {
            match write_ndjson(&mut out, &envelope) {
                Ok(()) => written += 1,
                Err(e) => warn!(error = %e, "dropping event, output not writable"),
            }
        }
        written
    })
}
