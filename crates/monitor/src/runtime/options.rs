use std::time::Duration;

use crate::{define_flag, sync::MonitorError, sync::waiter::NIL};

pub struct MonitorFlags;

define_flag!(MonitorFlags =>
    i32,
    spin_limit,
    5000,
    "Upper bound of the adaptive spin duration. (default 5000)"
);
define_flag!(MonitorFlags =>
    i32,
    pre_spin,
    10,
    "Number of lock attempts made before adaptive spinning. (default 10)"
);
define_flag!(MonitorFlags =>
    i32,
    fixed_spin,
    0,
    "Spin exactly this many times instead of adapting when positive. (default 0)"
);
define_flag!(MonitorFlags =>
    i32,
    spin_bonus,
    100,
    "Added to the spin duration after a successful spin. (default 100)"
);
define_flag!(MonitorFlags =>
    i32,
    spin_penalty,
    200,
    "Subtracted from the spin duration after a failed spin. (default 200)"
);
define_flag!(MonitorFlags =>
    i32,
    spin_poverty,
    1000,
    "Spin duration a successful spin restarts from when it has fallen below this value. (default 1000)"
);
define_flag!(MonitorFlags =>
    usize,
    waiter_arena_capacity,
    8192,
    "Number of waiter nodes preallocated per runtime. (default 8192)"
);
define_flag!(MonitorFlags =>
    usize,
    monitor_deflation_max,
    1_000_000,
    "Maximum number of monitors deflated in one pass. (default 1000000)"
);
define_flag!(MonitorFlags =>
    usize,
    monitor_unlink_batch,
    500,
    "Number of deflated monitors released per batch while unlinking. (default 500)"
);
define_flag!(MonitorFlags =>
    u64,
    async_deflation_interval,
    250,
    "Milliseconds between checks of the deflation thread. (default 250)"
);
define_flag!(MonitorFlags =>
    usize,
    monitor_used_deflation_threshold,
    90,
    "Percentage of the in-use ceiling above which idle monitors are deflated, 0 disables. (default 90)"
);
define_flag!(MonitorFlags =>
    usize,
    in_use_list_ceiling,
    1024,
    "Expected number of monitors in use. (default 1024)"
);
define_flag!(MonitorFlags =>
    bool,
    deflation_thread,
    true,
    "Start the background monitor deflation thread. (default: true)"
);

/// Knobs of the monitor subsystem. Built from [`MonitorFlags`] or by hand.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MonitorOptions {
    pub spin_limit: i32,
    pub pre_spin: i32,
    pub fixed_spin: i32,
    pub spin_bonus: i32,
    pub spin_penalty: i32,
    pub spin_poverty: i32,
    pub waiter_arena_capacity: usize,
    pub monitor_deflation_max: usize,
    pub monitor_unlink_batch: usize,
    pub async_deflation_interval: Duration,
    pub monitor_used_deflation_threshold: usize,
    pub in_use_list_ceiling: usize,
    pub deflation_thread: bool,
}

impl Default for MonitorOptions {
    /// The flag defaults, ignoring anything parsed into the flags.
    fn default() -> Self {
        Self {
            spin_limit: monitorflags_spin_limit_default(),
            pre_spin: monitorflags_pre_spin_default(),
            fixed_spin: monitorflags_fixed_spin_default(),
            spin_bonus: monitorflags_spin_bonus_default(),
            spin_penalty: monitorflags_spin_penalty_default(),
            spin_poverty: monitorflags_spin_poverty_default(),
            waiter_arena_capacity: monitorflags_waiter_arena_capacity_default(),
            monitor_deflation_max: monitorflags_monitor_deflation_max_default(),
            monitor_unlink_batch: monitorflags_monitor_unlink_batch_default(),
            async_deflation_interval: Duration::from_millis(
                monitorflags_async_deflation_interval_default(),
            ),
            monitor_used_deflation_threshold: monitorflags_monitor_used_deflation_threshold_default(
            ),
            in_use_list_ceiling: monitorflags_in_use_list_ceiling_default(),
            deflation_thread: monitorflags_deflation_thread_default(),
        }
    }
}

impl MonitorOptions {
    pub fn from_flags() -> Result<Self, MonitorError> {
        let options = Self {
            spin_limit: monitorflags_spin_limit(),
            pre_spin: monitorflags_pre_spin(),
            fixed_spin: monitorflags_fixed_spin(),
            spin_bonus: monitorflags_spin_bonus(),
            spin_penalty: monitorflags_spin_penalty(),
            spin_poverty: monitorflags_spin_poverty(),
            waiter_arena_capacity: monitorflags_waiter_arena_capacity(),
            monitor_deflation_max: monitorflags_monitor_deflation_max(),
            monitor_unlink_batch: monitorflags_monitor_unlink_batch(),
            async_deflation_interval: Duration::from_millis(
                monitorflags_async_deflation_interval(),
            ),
            monitor_used_deflation_threshold: monitorflags_monitor_used_deflation_threshold(),
            in_use_list_ceiling: monitorflags_in_use_list_ceiling(),
            deflation_thread: monitorflags_deflation_thread(),
        };

        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), MonitorError> {
        if self.waiter_arena_capacity == 0 || self.waiter_arena_capacity >= NIL as usize {
            return Err(MonitorError::InvalidOption(format!(
                "waiter arena capacity must be in 1..{}, got {}",
                NIL, self.waiter_arena_capacity
            )));
        }

        if self.monitor_unlink_batch == 0 {
            return Err(MonitorError::InvalidOption(
                "monitor unlink batch must be positive".to_string(),
            ));
        }

        if self.monitor_used_deflation_threshold > 100 {
            return Err(MonitorError::InvalidOption(format!(
                "deflation threshold is a percentage, got {}",
                self.monitor_used_deflation_threshold
            )));
        }

        if self.async_deflation_interval.is_zero() {
            return Err(MonitorError::InvalidOption(
                "async deflation interval must be positive".to_string(),
            ));
        }

        if self.spin_limit < 0 || self.pre_spin < 0 || self.fixed_spin < 0 {
            return Err(MonitorError::InvalidOption(
                "spin counts must not be negative".to_string(),
            ));
        }

        Ok(())
    }

    /// Spinning only pays off when the owner can make progress on another processor.
    pub fn adjust_for_platform(self) -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        self.adjust_for_cpus(cpus)
    }

    pub(crate) fn adjust_for_cpus(mut self, cpus: usize) -> Self {
        if cpus == 1 {
            self.spin_limit = 0;
            self.pre_spin = 0;
            self.fixed_spin = 0;
        }
        self
    }

    pub(crate) fn adjust_up(&self, spin_duration: i32) -> i32 {
        let mut x = spin_duration;
        if x < self.spin_limit {
            if x < self.spin_poverty {
                x = self.spin_poverty;
            }
            x += self.spin_bonus;
        }
        x
    }

    pub(crate) fn adjust_down(&self, spin_duration: i32) -> i32 {
        let mut x = spin_duration;
        if x > 0 {
            x -= self.spin_penalty;
            if x < 0 {
                x = 0;
            }
        }
        x
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(MonitorOptions::default().validate().is_ok());
    }

    #[test]
    fn rejects_bad_capacity() {
        let options = MonitorOptions {
            waiter_arena_capacity: 0,
            ..Default::default()
        };
        assert!(matches!(
            options.validate(),
            Err(MonitorError::InvalidOption(_))
        ));
    }

    #[test]
    fn spin_adjustment() {
        let options = MonitorOptions::default();
        assert_eq!(options.adjust_up(0), 1100);
        assert_eq!(options.adjust_up(2000), 2100);
        assert_eq!(options.adjust_up(5000), 5000);
        assert_eq!(options.adjust_down(150), 0);
        assert_eq!(options.adjust_down(5000), 4800);
        assert_eq!(options.adjust_down(0), 0);
    }

    #[test]
    fn defaults_follow_the_flags() {
        let options = MonitorOptions::default();
        assert_eq!(options.spin_limit, monitorflags_spin_limit_default());
        assert_eq!(options.pre_spin, monitorflags_pre_spin_default());
        assert_eq!(
            options.waiter_arena_capacity,
            monitorflags_waiter_arena_capacity_default()
        );
        assert_eq!(
            options.async_deflation_interval,
            Duration::from_millis(monitorflags_async_deflation_interval_default())
        );
        assert_eq!(options.deflation_thread, monitorflags_deflation_thread_default());
    }

    #[test]
    fn single_cpu_disables_spinning() {
        let options = MonitorOptions {
            fixed_spin: 50,
            ..Default::default()
        };
        let adjusted = options.clone().adjust_for_cpus(1);
        assert_eq!(adjusted.spin_limit, 0);
        assert_eq!(adjusted.pre_spin, 0);
        assert_eq!(adjusted.fixed_spin, 0);
        assert_eq!(adjusted.spin_bonus, options.spin_bonus);

        assert_eq!(options.clone().adjust_for_cpus(4), options);
    }
}
