// Native function table: host functions exposed to scripts as ordinary
// globals. Mirrors `CLox/main.c`'s `clockNative` registration; the
// tree-walker's sprawling string/array/json standard library has no
// counterpart here — this VM only promises the native surface the
// language itself defines.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::value::Value;
use crate::vm::Vm;

pub fn register(vm: &mut Vm) {
    vm.define_native("clock", clock);
}

/// Seconds since the Unix epoch, as a float. Matches CLox's `clock() /
/// CLOCKS_PER_SEC` convention of returning fractional seconds.
fn clock(_args: &[Value]) -> Value {
    let elapsed = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    Value::Number(elapsed.as_secs_f64())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_returns_a_nonnegative_number() {
        match clock(&[]) {
            Value::Number(n) => assert!(n > 0.0),
            other => panic!("expected a number, got {other:?}"),
        }
    }
}
