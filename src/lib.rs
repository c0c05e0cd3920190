//! HTTP service in front of a fine-tuned GPT-2 (Shakespeare) model.
//!
//! Routes: `GET /`, `POST /send-text`, `POST /send-text-len`,
//! `POST /send-model-response`, `GET /health`.

pub mod api;
pub mod app_state;
pub mod artifacts;
pub mod config;
pub mod cors;
pub mod engine;
pub mod error;
pub mod gpt2;
pub mod types;

use rocket::figment::Figment;
use rocket::{catchers, routes, Build, Rocket};

use crate::engine::EngineLoader;

/// 默认配置来源 + Candle 引擎
pub fn rocket() -> Rocket<Build> {
    build(rocket::Config::figment(), engine::candle_loader())
}

pub fn build(figment: Figment, loader: EngineLoader) -> Rocket<Build> {
    rocket::custom(figment)
        .attach(cors::Cors)
        .attach(app_state::stage(loader))
        .attach(app_state::teardown())
        .mount(
            "/",
            routes![
                api::root,
                api::health,
                api::send_text,
                api::send_text_len,
                api::send_model_response,
                api::preflight,
            ],
        )
        .register("/", catchers![api::default_catcher])
}
