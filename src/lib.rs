//! Transport core for a distributed-messaging framework: a single-threaded,
//!  readiness-driven engine that multiplexes many non-blocking TCP connections,
//!  drives each connection through an explicit lifecycle state machine, and runs
//!  a binary framing protocol that ships in-memory buffers and whole files
//!  inline in a single logical packet.
//!
//! ## Design goals
//!
//! * One reactor thread owns everything: the poll object, every connection's
//!   state machine and every in-flight packet. There are no locks on the hot
//!   path; other threads talk to the reactor only through a mailbox and a
//!   wakeup handle.
//!   * all blocking happens inside the single poll call, bounded by the
//!     caller-supplied timeout
//!   * cancellation is expressed purely through lifecycle states - there is no
//!     separate cancellation token
//! * Connections are generic over the actual transport: plain TCP ships with
//!   the crate, and anything with a handshake step, a shutdown step and
//!   non-blocking reads/writes (e.g. TLS) plugs in behind the same trait
//! * The unit of exchange is a *packet* (defined-length chunks of buffers plus
//!   optional whole files), not a stream of bytes
//!   * packets are sequenced per direction, and both peers verify the sequence -
//!     a gap or reordering means the connection is compromised and is closed
//!   * one packet is in flight per direction at a time; the next packet cannot
//!     begin framing until the current one fully drains through the transport
//! * Partial I/O is the normal case, not the exception: every framing operation
//!   can be suspended after any byte and resumed on a later readiness event
//! * Files ride inline in the packet stream without being loaded into memory,
//!   through a transport fast path where available and a fixed spill buffer
//!   otherwise
//! * A misbehaving peer affects only its own connection: per-registration
//!   failures are contained, logged, and never stop the reactor
//!
//! ## Wire format
//!
//! Packet header (all numbers in network byte order, BE):
//! ```ascii
//! 0:  magic: u16 (0x1717)
//! 2:  protocol version: u16 (0x0001)
//! 4:  packet sequence number: u64, strictly monotonic per direction, no gaps
//! 12: buffer payload size in bytes: u32
//! 16: number of inline files: u32
//! ```
//!
//! After the fixed 20-byte header:
//! ```ascii
//! *: file length table: one u64 per file (only present if file count > 0)
//! *: buffer payload: `buffer size` bytes
//! *: file bodies, back to back, each exactly as long as its table entry
//! ```
//!
//! Zero-length packets (no payload, no files) are valid and are used by
//! handshake and disconnect exchanges.

pub mod transport;
pub mod util;
pub mod test_util;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
