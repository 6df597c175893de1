fn main() {
    if let Err(err) = atelier_server::cli::run_atelier() {
        tracing::error!(error = %err, "atelier failed");
        std::process::exit(1);
    }
}
