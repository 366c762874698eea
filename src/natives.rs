// File: src/natives.rs
//
// Fixed native-function registry. Each entry is plain Rust and must never
// call back into the VM, so it only ever sees the argument slice and
// returns a `Value` or an error message.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::object::NativeFn;
use crate::value::Value;

/// `(name, arity, function)` triples the VM registers as globals at
/// startup.
pub const NATIVES: &[(&str, u8, NativeFn)] = &[("clock", 0, clock)];

fn clock(_args: &[Value]) -> Result<Value, String> {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| format!("system clock error: {}", e))?;
    Ok(Value::Number(elapsed.as_secs_f64()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_returns_a_non_negative_number() {
        match clock(&[]) {
            Ok(Value::Number(n)) => assert!(n >= 0.0),
            other => panic!("expected Ok(Number(_)), got {:?}", other.map(|_| ())),
        }
    }
}
