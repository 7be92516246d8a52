use crate::log::{LogDebug, LogWarn};
use std::time::{SystemTime, UNIX_EPOCH};

/// Host-side function computing a variable's value on every read.
pub type TsvGetter = fn() -> i64;

/// The built-in microsecond timestamp variable.
pub const TIMESTAMP_TSV: u32 = 1;

#[derive(Clone, Debug)]
pub struct TraceStateVariable {
    pub number: u32,
    pub name: Option<String>,
    pub initial_value: i64,
    pub value: i64,
    pub getter: Option<TsvGetter>,
}

/// Microseconds since the epoch.
pub fn get_timestamp() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_micros() as i64,
        Err(_) => 0,
    }
}

/// Variables are few, so lookup is a linear scan by number.
#[derive(Clone, Debug, Default)]
pub struct TsvRegistry {
    vars: Vec<TraceStateVariable>,
}

impl TsvRegistry {
    pub fn new() -> TsvRegistry {
        TsvRegistry::default()
    }

    /// A registry holding the built-in `trace_timestamp` variable.
    pub fn with_builtins() -> TsvRegistry {
        let mut registry = TsvRegistry::new();
        let tsv = registry.create(TIMESTAMP_TSV);
        tsv.name = Some("trace_timestamp".into());
        tsv.getter = Some(get_timestamp);
        registry
    }

    pub fn get(&self, num: u32) -> Option<&TraceStateVariable> {
        self.vars.iter().find(|v| v.number == num)
    }

    pub fn get_mut(&mut self, num: u32) -> Option<&mut TraceStateVariable> {
        self.vars.iter_mut().find(|v| v.number == num)
    }

    /// Find variable `num`, creating it with value 0 if it does not exist yet.
    pub fn create(&mut self, num: u32) -> &mut TraceStateVariable {
        let index = match self.vars.iter().position(|v| v.number == num) {
            Some(index) => index,
            None => {
                self.vars.push(TraceStateVariable {
                    number: num,
                    name: None,
                    initial_value: 0,
                    value: 0,
                    getter: None,
                });
                self.vars.len() - 1
            }
        };
        &mut self.vars[index]
    }

    /// Define (or redefine) a variable as the controller does before a run.
    pub fn define(&mut self, num: u32, initial_value: i64, name: Option<String>) {
        let tsv = self.create(num);
        if tsv.getter.is_some() {
            log!(
                LogWarn,
                "Not redefining built-in trace state variable {} ({:?})",
                num,
                tsv.name
            );
            return;
        }
        tsv.initial_value = initial_value;
        tsv.value = initial_value;
        tsv.name = name;
    }

    /// Current value. A getter, if any, is consulted on every read.
    /// Unknown variables read as 0.
    pub fn value(&self, num: u32) -> i64 {
        match self.get(num) {
            Some(TraceStateVariable {
                getter: Some(getter),
                ..
            }) => getter(),
            Some(tsv) => tsv.value,
            None => {
                log!(LogDebug, "No trace state variable {}, skipping value get", num);
                0
            }
        }
    }

    /// Returns false if the variable does not exist.
    pub fn set_value(&mut self, num: u32, value: i64) -> bool {
        match self.get_mut(num) {
            Some(tsv) => {
                tsv.value = value;
                true
            }
            None => {
                log!(LogDebug, "No trace state variable {}, skipping value set", num);
                false
            }
        }
    }

    /// Reset every stored value to its initial value, as at the start of a run.
    pub fn reset_values(&mut self) {
        for tsv in &mut self.vars {
            tsv.value = tsv.initial_value;
        }
    }

    /// Drop every variable without a getter. Built-ins survive.
    pub fn clear_user_variables(&mut self) {
        self.vars.retain(|v| v.getter.is_some());
    }

    pub fn iter(&self) -> impl Iterator<Item = &TraceStateVariable> {
        self.vars.iter()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constant_getter() -> i64 {
        1234
    }

    #[test]
    fn getter_overrides_value_test() {
        let mut reg = TsvRegistry::new();
        let tsv = reg.create(9);
        tsv.getter = Some(constant_getter);
        tsv.value = 5;
        assert_eq!(reg.value(9), 1234);
    }

    #[test]
    fn clear_keeps_builtins_test() {
        let mut reg = TsvRegistry::with_builtins();
        reg.define(2, 10, Some("counter".into()));
        reg.define(3, -1, None);
        assert_eq!(reg.len(), 3);
        reg.clear_user_variables();
        assert_eq!(reg.len(), 1);
        assert!(reg.get(TIMESTAMP_TSV).is_some());
        assert!(reg.value(TIMESTAMP_TSV) > 0);
    }

    #[test]
    fn missing_variable_test() {
        let mut reg = TsvRegistry::new();
        assert_eq!(reg.value(42), 0);
        assert!(!reg.set_value(42, 7));
        assert!(reg.get(42).is_none());
    }

    #[test]
    fn define_and_reset_test() {
        let mut reg = TsvRegistry::new();
        reg.define(4, 100, None);
        assert!(reg.set_value(4, 7));
        assert_eq!(reg.value(4), 7);
        reg.reset_values();
        assert_eq!(reg.value(4), 100);
    }

    #[test]
    fn builtin_not_redefined_test() {
        let mut reg = TsvRegistry::with_builtins();
        reg.define(TIMESTAMP_TSV, 5, Some("mine".into()));
        assert_eq!(reg.get(TIMESTAMP_TSV).unwrap().name.as_deref(), Some("trace_timestamp"));
    }
}
