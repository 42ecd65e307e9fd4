// Device-free surface checks: configuration loading and reproducible UID
// streams through the public API.

use anyhow::Result;
use glaze::{Config, UidStream};

#[test]
fn missing_config_falls_back_to_defaults() -> Result<()> {
    let config = Config::load_from_path("does-not-exist.toml")?;
    assert_eq!(config.window.width, 1280);
    assert_eq!(config.window.height, 720);
    assert_eq!(config.present_mode(), ash::vk::PresentModeKHR::FIFO);
    Ok(())
}

#[test]
fn injected_seed_reproduces_a_uid_sequence() {
    let first: Vec<u64> = {
        let stream = UidStream::with_seed(0x00c0_ffee_0000_cafe);
        (0..32).map(|_| stream.next()).collect()
    };
    let second: Vec<u64> = {
        let stream = UidStream::with_seed(0x00c0_ffee_0000_cafe);
        (0..32).map(|_| stream.next()).collect()
    };
    assert_eq!(first, second);
}
