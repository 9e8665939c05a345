fn main() -> anyhow::Result<()> {
    cardgate::run()
}
