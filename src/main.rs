fn main() -> anyhow::Result<()> {
    copyboard::cli::run()
}
