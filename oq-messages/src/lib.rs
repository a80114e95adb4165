//! Wire types shared between the Starmap dispatcher and its workers.
//!
//! Everything a worker ever receives or sends back travels as one of the
//! types in this crate: task [`Envelope`]s go down, [`ReplyEnvelope`]s come
//! back on the ingress, and both carry a [`Monitor`] so the dispatcher can
//! account for time and memory spent on the other side.

pub mod envelope;
pub mod monitor;
pub mod pack;
pub mod reply;
pub mod wire;

pub use envelope::Envelope;
pub use monitor::Monitor;
pub use pack::Packed;
pub use pack::PackedSeq;
pub use reply::Reply;
pub use reply::ReplyEnvelope;

/// Identifies the worker that produced a reply.
pub type WorkerId = (String, u32);

/// The engine version stamped on monitors and checked by workers.
pub fn engine_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

const KB: u64 = 1024;
const MB: u64 = 1024 * KB;
const GB: u64 = 1024 * MB;
const TB: u64 = 1024 * GB;

/// Formats a byte count for log lines, e.g. `humansize(2_500_000) == "2.38 MB"`.
pub fn humansize(nbytes: u64) -> String {
    if nbytes < KB {
        format!("{} B", nbytes)
    } else if nbytes < MB {
        format!("{:.2} KB", nbytes as f64 / KB as f64)
    } else if nbytes < GB {
        format!("{:.2} MB", nbytes as f64 / MB as f64)
    } else if nbytes < TB {
        format!("{:.2} GB", nbytes as f64 / GB as f64)
    } else {
        format!("{:.2} TB", nbytes as f64 / TB as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::humansize;

    #[test]
    fn humansize_units() {
        assert_eq!(humansize(512), "512 B");
        assert_eq!(humansize(2048), "2.00 KB");
        assert_eq!(humansize(5 * 1024 * 1024), "5.00 MB");
    }
}
