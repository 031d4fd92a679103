//! Wall-clock helper. Mirrors `original_source/blockchain_sim/core/utils.py`'s
//! `timestamp()`: every timestamp in this crate is seconds since the
//! Unix epoch, as an `f64`, to match the source's `time.time()`.

use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is after the Unix epoch")
        .as_secs_f64()
}
