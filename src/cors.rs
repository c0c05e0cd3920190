use rocket::fairing::{Fairing, Info, Kind};
use rocket::http::{Header, Method, Status};
use rocket::{Build, Request, Response, Rocket};

use crate::config::CorsConfig;

const ALLOWED_METHODS: &str = "DELETE, GET, HEAD, OPTIONS, PATCH, POST, PUT";

/// 给所有响应（包括 catcher 的错误响应）加 CORS 头，并应答 preflight
pub struct Cors;

/// ignite 时从配置中取出，on_response 时通过 managed state 读取
#[derive(Debug, Clone)]
pub struct CorsPolicy {
    config: CorsConfig,
}

impl CorsPolicy {
    pub fn new(config: CorsConfig) -> Self {
        Self { config }
    }

    /// 计算 Access-Control-Allow-Origin 的值；None 表示不放行
    pub fn allow_origin(&self, origin: Option<&str>, has_cookie: bool) -> Option<String> {
        if self.config.allows_any_origin() {
            // 带 cookie 的凭证请求不能用 `*`，回显来源
            return match origin {
                Some(origin) if has_cookie && self.config.allow_credentials => {
                    Some(origin.to_string())
                }
                _ => Some("*".to_string()),
            };
        }

        let origin = origin?;
        self.config
            .allowed_origins
            .iter()
            .any(|o| o == origin)
            .then(|| origin.to_string())
    }

    fn apply(&self, req: &Request<'_>, res: &mut Response<'_>) {
        let origin = req.headers().get_one("Origin");
        let has_cookie = req.headers().contains("Cookie");

        let Some(allow_origin) = self.allow_origin(origin, has_cookie) else {
            return;
        };

        if allow_origin != "*" {
            res.adjoin_header(Header::new("Vary", "Origin"));
        }
        res.set_header(Header::new("Access-Control-Allow-Origin", allow_origin));
        if self.config.allow_credentials {
            res.set_header(Header::new("Access-Control-Allow-Credentials", "true"));
        }

        let is_preflight = req.method() == Method::Options
            && req.headers().contains("Access-Control-Request-Method");
        if is_preflight {
            let allow_headers = req
                .headers()
                .get_one("Access-Control-Request-Headers")
                .unwrap_or("*")
                .to_string();
            res.set_header(Header::new("Access-Control-Allow-Methods", ALLOWED_METHODS));
            res.set_header(Header::new("Access-Control-Allow-Headers", allow_headers));
            res.set_header(Header::new(
                "Access-Control-Max-Age",
                self.config.max_age.to_string(),
            ));
            res.set_status(Status::Ok);
        }
    }
}

#[rocket::async_trait]
impl Fairing for Cors {
    fn info(&self) -> Info {
        Info {
            name: "CORS",
            kind: Kind::Ignite | Kind::Response,
        }
    }

    async fn on_ignite(&self, rocket: Rocket<Build>) -> rocket::fairing::Result {
        let config: CorsConfig = match rocket.figment().extract_inner("cors") {
            Ok(config) => config,
            Err(e) if e.missing() => CorsConfig::default(),
            Err(e) => {
                tracing::error!(error = %e, "invalid cors configuration");
                return Err(rocket);
            }
        };

        if config.allows_any_origin() {
            tracing::warn!("CORS allows any origin; restrict `cors.allowed_origins` outside development");
        }

        Ok(rocket.manage(CorsPolicy::new(config)))
    }

    async fn on_response<'r>(&self, req: &'r Request<'_>, res: &mut Response<'r>) {
        if let Some(policy) = req.rocket().state::<CorsPolicy>() {
            policy.apply(req, res);
        }
    }
}
