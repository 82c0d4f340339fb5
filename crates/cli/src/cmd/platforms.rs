use anyhow::Result;

use crossbake_lib::Platform;
use crossbake_lib::platform::supported_platforms;

use crate::output::{OutputFormat, print_json, print_note};

pub fn cmd_platforms(output: OutputFormat) -> Result<()> {
  let host = Platform::host();
  let platforms = supported_platforms();

  if output.is_json() {
    let items: Vec<_> = platforms
      .iter()
      .map(|p| {
        serde_json::json!({
          "triplet": p.triplet(),
          "host": host.as_ref() == Some(p),
        })
      })
      .collect();
    return print_json(&items);
  }

  for platform in &platforms {
    if host.as_ref() == Some(platform) {
      println!("  {} (host)", platform);
    } else {
      println!("  {}", platform);
    }
  }
  if let Some(host) = host
    && !platforms.contains(&host)
  {
    print_note(&format!("Host {} is not a build target", host));
  }
  Ok(())
}
