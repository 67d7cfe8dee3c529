use std::sync::{
    Arc,
    atomic::{AtomicU8, AtomicUsize, Ordering},
};

use tokio::sync::OnceCell;
use tracing::error;

use super::service::{MathEngine, RenderEngine, RenderPipelineConfig};
use super::types::RenderError;

const UNINITIALIZED: u8 = 0;
const INITIALIZING: u8 = 1;
const READY: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Initializing,
    Ready,
}

/// Owned, lazily initialized handle to a [`RenderEngine`].
///
/// The first caller of [`EngineSlot::ensure_ready`] runs initialization;
/// callers arriving meanwhile wait on that same attempt. A failed attempt
/// leaves the slot uninitialized so the next caller retries.
pub struct EngineSlot {
    config: RenderPipelineConfig,
    math: Arc<dyn MathEngine>,
    engine: OnceCell<Arc<RenderEngine>>,
    state: AtomicU8,
    attempts: AtomicUsize,
}

impl EngineSlot {
    pub fn new(config: RenderPipelineConfig, math: Arc<dyn MathEngine>) -> Self {
        Self {
            config,
            math,
            engine: OnceCell::new(),
            state: AtomicU8::new(UNINITIALIZED),
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn state(&self) -> EngineState {
        match self.state.load(Ordering::Acquire) {
            READY => EngineState::Ready,
            INITIALIZING => EngineState::Initializing,
            _ => EngineState::Uninitialized,
        }
    }

    /// Number of initialization attempts started so far.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::Relaxed)
    }

    pub async fn ensure_ready(&self) -> Result<Arc<RenderEngine>, RenderError> {
        if let Some(engine) = self.engine.get() {
            return Ok(Arc::clone(engine));
        }

        let engine = self
            .engine
            .get_or_try_init(|| async {
                self.state.store(INITIALIZING, Ordering::Release);
                self.attempts.fetch_add(1, Ordering::Relaxed);
                match RenderEngine::initialize(self.config.clone(), Arc::clone(&self.math)).await {
                    Ok(engine) => Ok(Arc::new(engine)),
                    Err(err) => {
                        self.state.store(UNINITIALIZED, Ordering::Release);
                        error!(
                            target = "application::render::engine",
                            error = %err,
                            "render engine initialization failed"
                        );
                        Err(err)
                    }
                }
            })
            .await?;

        self.state.store(READY, Ordering::Release);
        Ok(Arc::clone(engine))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::render::service::MathError;
    use crate::application::render::types::MathKind;

    struct Echo;

    impl MathEngine for Echo {
        fn typeset(&self, source: &str, _kind: MathKind) -> Result<String, MathError> {
            Ok(source.to_string())
        }
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_initialization() {
        let slot = EngineSlot::new(RenderPipelineConfig::default(), Arc::new(Echo));
        assert_eq!(slot.state(), EngineState::Uninitialized);

        let (first, second) = tokio::join!(slot.ensure_ready(), slot.ensure_ready());
        let first = first.expect("first caller");
        let second = second.expect("second caller");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(slot.attempts(), 1);
        assert_eq!(slot.state(), EngineState::Ready);

        let third = slot.ensure_ready().await.expect("cached");
        assert!(Arc::ptr_eq(&first, &third));
    }

    #[tokio::test]
    async fn failed_initialization_is_retried() {
        let config = RenderPipelineConfig {
            theme: "missing".into(),
            ..RenderPipelineConfig::default()
        };
        let slot = EngineSlot::new(config, Arc::new(Echo));

        assert!(slot.ensure_ready().await.is_err());
        assert_eq!(slot.state(), EngineState::Uninitialized);
        assert!(slot.ensure_ready().await.is_err());
        assert_eq!(slot.attempts(), 2);
    }
}
