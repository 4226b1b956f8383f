fn main() {
    if let Err(err) = relay_node::cli::run() {
        tracing::error!(error = %err, "relay-node failed");
        std::process::exit(1);
    }
}
