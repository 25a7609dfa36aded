pub mod diffusion;
pub mod editing;
pub mod error;
pub mod models;

// Re-export common types
pub use editing::{load_config, run_from_config, Config, ProcessConfig, SamplingOrchestrator};
pub use error::EditError;

pub mod logging {
    use log::LevelFilter;
    use env_logger::Builder;
    use std::io::Write;

    /// Timestamped logger at info level, overridable through `RUST_LOG`
    pub fn init_logger() {
        Builder::new()
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{} [{}] {} - {}",
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                    record.level(),
                    record.target(),
                    record.args()
                )
            })
            .filter(None, LevelFilter::Info)
            .parse_default_env()
            .init();
    }
}
