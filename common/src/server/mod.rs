use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::err::osc_error::OscError;

/// 全进程共享的取消标志。worker 在 chunk/batch 之间与每次限流唤醒时检查。
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Returns Err(Cancelled) once the flag is set; workers call this at
    /// every suspension point.
    pub fn check(&self) -> Result<(), OscError> {
        if self.is_cancelled() {
            return Err(OscError::Cancelled);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::CancelToken;

    #[test]
    fn test_cancel() {
        let t = CancelToken::new();
        assert!(t.check().is_ok());

        let t2 = t.clone();
        t2.cancel();
        assert!(t.is_cancelled());
        assert!(t.check().is_err());
    }
}
