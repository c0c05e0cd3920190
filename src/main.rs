use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // Rocket 自己也会装 logger，这里失败不致命
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

#[rocket::main]
async fn main() -> Result<(), rocket::Error> {
    init_tracing();

    let _rocket = shakespeare_server::rocket().launch().await?;
    Ok(())
}
