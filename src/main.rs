use clap::Parser;

fn main() -> anyhow::Result<()> {
    let cfg = attestationd::config::Config::parse();
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(attestationd::run(cfg))
}
