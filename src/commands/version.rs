pub fn run() -> anyhow::Result<()> {
    println!("kube-activity {}", env!("CARGO_PKG_VERSION"));
    Ok(())
}
