use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use rocket::fairing::AdHoc;
use tokio::sync::{OnceCell, Semaphore, SemaphorePermit};

use crate::config::AppConfig;
use crate::engine::{EngineLoader, InferenceEngine};
use crate::error::{GenerationError, LoadError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelStatus {
    Unloaded,
    Loading,
    Loaded,
    Error,
}

impl fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// 全局共享状态：
/// - engine: 进程内唯一的 ModelHandle，只初始化一次，所有请求共用
/// - status: 模型当前状态，供 /health 使用
/// - semaphore: 控制最多 N 个并发推理任务
pub struct AppState {
    pub config: AppConfig,
    loader: EngineLoader,
    engine: OnceCell<Arc<dyn InferenceEngine>>,
    status: RwLock<ModelStatus>,
    semaphore: Semaphore,
}

impl AppState {
    pub fn new(config: AppConfig, loader: EngineLoader) -> Self {
        let permits = config.max_concurrent_generations.max(1);
        Self {
            config,
            loader,
            engine: OnceCell::new(),
            status: RwLock::new(ModelStatus::Unloaded),
            semaphore: Semaphore::new(permits),
        }
    }

    pub fn model_status(&self) -> ModelStatus {
        *self.status.read()
    }

    fn set_status(&self, status: ModelStatus) {
        *self.status.write() = status;
    }

    /// 获取 ModelHandle；第一次调用时加载，并发的调用者等待同一次加载。
    /// 加载失败不会被缓存，下一次请求会重新尝试。
    pub async fn engine(&self) -> Result<Arc<dyn InferenceEngine>, LoadError> {
        let engine = self
            .engine
            .get_or_try_init(|| async {
                self.set_status(ModelStatus::Loading);
                let loader = Arc::clone(&self.loader);
                let path = self.config.model_path.clone();
                tracing::info!(path = %path.display(), "loading model");

                let max_length = self.config.generation.max_length;
                let loaded = tokio::task::spawn_blocking(move || loader(&path))
                    .await
                    .map_err(|e| LoadError::Worker(e.to_string()))
                    .and_then(|result| result)
                    .and_then(|engine| match engine.context_window() {
                        Some(window) if max_length > window => {
                            Err(LoadError::MaxLengthExceedsWindow { max_length, window })
                        }
                        _ => Ok(engine),
                    });

                match &loaded {
                    Ok(_) => self.set_status(ModelStatus::Loaded),
                    Err(e) => {
                        tracing::error!(error = %e, "failed to load model");
                        self.set_status(ModelStatus::Error);
                    }
                }
                loaded
            })
            .await?;
        Ok(Arc::clone(engine))
    }

    /// 推理许可；超过并发上限时排队
    pub async fn generation_permit(&self) -> Result<SemaphorePermit<'_>, GenerationError> {
        self.semaphore
            .acquire()
            .await
            .map_err(|e| GenerationError::Worker(e.to_string()))
    }

    fn release(&self) {
        if let Some(engine) = self.engine.get() {
            tracing::info!(model = engine.model_name(), "releasing model");
        }
        self.semaphore.close();
        self.set_status(ModelStatus::Unloaded);
    }
}

/// ignite 时读取配置、构造 AppState；`preload_model` 打开时在这里就加载模型，
/// 加载失败直接让 launch 失败
pub fn stage(loader: EngineLoader) -> AdHoc {
    AdHoc::try_on_ignite("Model runtime", move |rocket| async move {
        let config: AppConfig = match rocket.figment().extract() {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(error = %e, "invalid application configuration");
                return Err(rocket);
            }
        };

        let state = AppState::new(config, loader);
        if state.config.preload_model {
            if let Err(e) = state.engine().await {
                tracing::error!(
                    path = %state.config.model_path.display(),
                    error = %e,
                    "model preload failed, refusing to launch"
                );
                return Err(rocket);
            }
        }

        Ok(rocket.manage(state))
    })
}

pub fn teardown() -> AdHoc {
    AdHoc::on_shutdown("Model teardown", |rocket| {
        Box::pin(async move {
            if let Some(state) = rocket.state::<AppState>() {
                state.release();
            }
        })
    })
}
