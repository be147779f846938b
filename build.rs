fn main() -> anyhow::Result<()> {
    shadow_rs::new()?;

    Ok(())
}
