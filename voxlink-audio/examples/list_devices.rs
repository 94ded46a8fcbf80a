//! List available input devices

use voxlink_audio::AudioCapture;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("Input devices on this system:");
    AudioCapture::print_devices()?;
    Ok(())
}
