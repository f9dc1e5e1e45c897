use crate::sync::ObjectMonitor;

/// Scoped increment of a monitor's contention count. While any mark is
/// alive the deflater cannot claim the monitor.
pub struct ContentionMark<'a> {
    monitor: &'a ObjectMonitor,
    extended: bool,
}

impl<'a> ContentionMark<'a> {
    pub fn new(monitor: &'a ObjectMonitor) -> Self {
        monitor.add_to_contentions(1);
        Self {
            monitor,
            extended: false,
        }
    }

    /// Takes one more count that outlives the mark. Used after cancelling a
    /// deflation: the matching decrement is done by the deflater once it
    /// notices the cancellation.
    pub fn extend(&mut self) {
        debug_assert!(!self.extended, "contention mark extended twice");
        self.extended = true;
        self.monitor.add_to_contentions(1);
    }

    pub fn is_extended(&self) -> bool {
        self.extended
    }
}

impl Drop for ContentionMark<'_> {
    fn drop(&mut self) {
        self.monitor.add_to_contentions(-1);
    }
}
