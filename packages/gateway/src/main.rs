fn main() {
    if let Err(err) = flint_gateway::cli::run_flint() {
        tracing::error!(error = %err, "flint failed");
        std::process::exit(1);
    }
}
