//! Build-once state for lazily constructed model artifacts.

/// An artifact that is either not built yet or built exactly once.
#[derive(Debug, Clone, Default)]
pub enum Stage<T> {
    #[default]
    Uninitialized,
    Built(T),
}

impl<T> Stage<T> {
    pub fn is_built(&self) -> bool {
        matches!(self, Stage::Built(_))
    }

    pub fn get(&self) -> Option<&T> {
        match self {
            Stage::Built(v) => Some(v),
            Stage::Uninitialized => None,
        }
    }

    /// Run `build` on the first call only; later calls return the stored
    /// artifact.  A failed build leaves the stage uninitialised.
    pub fn get_or_try_build<E, F>(&mut self, build: F) -> Result<&T, E>
    where
        F: FnOnce() -> Result<T, E>,
    {
        if let Stage::Uninitialized = self {
            *self = Stage::Built(build()?);
        }
        match self {
            Stage::Built(v) => Ok(v),
            Stage::Uninitialized => unreachable!("stage was built above"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_once() {
        let mut stage = Stage::default();
        let mut calls = 0;
        for _ in 0..3 {
            let v = stage
                .get_or_try_build(|| {
                    calls += 1;
                    Ok::<_, ()>(7)
                })
                .unwrap();
            assert_eq!(*v, 7);
        }
        assert_eq!(calls, 1);
        assert!(stage.is_built());
    }

    #[test]
    fn failed_build_can_be_retried() {
        let mut stage: Stage<u8> = Stage::Uninitialized;
        assert!(stage.get_or_try_build(|| Err("boom")).is_err());
        assert!(!stage.is_built());
        assert_eq!(stage.get_or_try_build(|| Ok::<_, &str>(1)), Ok(&1));
        assert_eq!(stage.get(), Some(&1));
    }
}
