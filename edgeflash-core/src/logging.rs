pub const LOG_DIR: &str = "/var/log/edgeflash";
pub const LOG_FILE: &str = "/var/log/edgeflash/edgeflash.log";

pub fn init(verbose: bool) {
    use env_logger::Target;
    use std::fs;
    use std::io;

    // Prefer a stable log location on the provisioning host. If we cannot
    // create the file (permissions, readonly FS, etc.), fall back to stderr.
    let target = (|| -> io::Result<Target> {
        fs::create_dir_all(LOG_DIR)?;
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(LOG_FILE)?;
        Ok(Target::Pipe(Box::new(file)))
    })()
    .unwrap_or(Target::Stderr);

    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    // RUST_LOG still wins over the default level.
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .target(target)
        .init();
}
