fn main() {
    if let Err(err) = mcp_gateway::cli::run_gateway() {
        tracing::error!(error = %err, "mcp-gateway failed");
        std::process::exit(1);
    }
}
