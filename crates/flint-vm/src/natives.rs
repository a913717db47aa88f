//! Host routines exposed to Flint programs.

use std::sync::OnceLock;
use std::time::Instant;

use flint_core::Value;

static START: OnceLock<Instant> = OnceLock::new();

/// Pin the zero point of `clock()` as early as possible.
pub(crate) fn arm_clock() {
    let _ = START.get_or_init(Instant::now);
}

/// `clock()`: seconds since process start, as a number.
pub(crate) fn clock(_args: &[Value]) -> Value {
    let start = START.get_or_init(Instant::now);
    Value::Number(start.elapsed().as_secs_f64())
}
