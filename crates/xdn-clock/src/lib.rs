//! # xdn-clock: Vector clocks for `xdn`
//!
//! A [`VectorClock`] maps a fixed set of node ids to logical counters and
//! orders observations by the standard causal-history partial order.
//!
//! ## Comparability
//!
//! Two clocks are *comparable* only when they range over exactly the same
//! node set. Relations between clocks over different node sets are not
//! defined: the relational predicates panic on them, and
//! [`VectorClock::compare`] returns [`ClockError::Incomparable`].
//!
//! ```text
//!   {AR0:1, AR1:2}  vs {AR0:1, AR1:3}        → Less
//!   {AR0:2, AR1:0}  vs {AR0:0, AR1:1}        → Concurrent
//!   {AR0:1, AR1:2}  vs {AR0:1, AR1:2, AR2:0} → incomparable
//! ```
//!
//! ## Text form
//!
//! `VectorTimestamp/<id>:<counter>(.<id>:<counter>)*/`
//!
//! Pair order in the encoded form follows map iteration order and is not
//! stable; decoding accepts pairs in any order.
//!
//! ## Example
//!
//! ```
//! use xdn_clock::VectorClock;
//!
//! let c1 = VectorClock::new(["AR0", "AR1", "AR2"]);
//! let mut c2 = c1.clone();
//! c2.tick("AR1").tick("AR1").tick("AR2");
//!
//! assert!(c2.is_greater_than(&c1));
//! assert!(c1.is_less_than(&c2));
//!
//! let decoded: VectorClock = c2.to_string().parse().unwrap();
//! assert!(decoded.is_equal_to(&c2));
//! ```

mod clock;
mod codec;
mod error;
mod shared;

pub use clock::{CausalOrdering, VectorClock};
pub use codec::ENCODED_PREFIX;
pub use error::{ClockError, ClockParseError, ClockResult};
pub use shared::SharedVectorClock;
