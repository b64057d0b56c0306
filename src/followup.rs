use std::time::Duration;
use tokio::time::Instant;

/// Permission for a screen change alone to reach the planner.
///
/// Opened only when a spoken instruction finishes; closed by a new listening
/// session or by expiry. Callers own the expiry timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FollowUpWindow {
    #[default]
    Closed,
    Open {
        expires_at: Instant,
    },
}

impl FollowUpWindow {
    pub fn open(&mut self, now: Instant, duration: Duration) {
        *self = FollowUpWindow::Open {
            expires_at: now + duration,
        };
    }

    pub fn close(&mut self) {
        *self = FollowUpWindow::Closed;
    }

    /// Open and not yet expired. An expired window is closed on the way.
    pub fn is_open(&mut self, now: Instant) -> bool {
        match *self {
            FollowUpWindow::Open { expires_at } if expires_at > now => true,
            FollowUpWindow::Open { .. } => {
                self.close();
                false
            }
            FollowUpWindow::Closed => false,
        }
    }

    pub fn expires_at(&self) -> Option<Instant> {
        match self {
            FollowUpWindow::Open { expires_at } => Some(*expires_at),
            FollowUpWindow::Closed => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_by_default() {
        let mut window = FollowUpWindow::default();
        assert!(!window.is_open(Instant::now()));
        assert_eq!(window.expires_at(), None);
    }

    #[test]
    fn expires_after_duration() {
        let now = Instant::now();
        let mut window = FollowUpWindow::default();
        window.open(now, Duration::from_secs(60));
        assert!(window.is_open(now + Duration::from_secs(59)));
        assert!(!window.is_open(now + Duration::from_secs(60)));
        assert_eq!(window, FollowUpWindow::Closed);
    }

    #[test]
    fn explicit_close_wins() {
        let now = Instant::now();
        let mut window = FollowUpWindow::default();
        window.open(now, Duration::from_secs(60));
        window.close();
        assert!(!window.is_open(now));
    }

    #[test]
    fn reopening_extends() {
        let now = Instant::now();
        let mut window = FollowUpWindow::default();
        window.open(now, Duration::from_secs(60));
        window.open(now + Duration::from_secs(30), Duration::from_secs(60));
        assert!(window.is_open(now + Duration::from_secs(80)));
    }
}
