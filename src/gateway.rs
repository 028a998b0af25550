use std::time::Duration;
use tracing::{debug, info};

use crate::config::GatewayConfig;
use crate::errors::{EdgeError, Result};

/// Registers camera streams with a go2rtc-compatible relay for browser playback
#[derive(Clone)]
pub struct VideoGateway {
    base_url: url::Url,
    client: reqwest::Client,
}

impl VideoGateway {
    pub fn new(config: &GatewayConfig) -> Result<Self> {
        let base_url = url::Url::parse(&config.base_url)?;
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self { base_url, client })
    }

    pub fn stream_name(camera_id: i64) -> String {
        format!("camera_{}", camera_id)
    }

    pub fn streams_url(&self, name: &str, source: &str) -> Result<url::Url> {
        let mut url = self.base_url.join("api/streams")?;
        url.query_pairs_mut()
            .append_pair("name", name)
            .append_pair("src", source);
        Ok(url)
    }

    pub async fn register(&self, camera_id: i64, stream_uri: &str) -> Result<()> {
        let name = Self::stream_name(camera_id);
        let url = self.streams_url(&name, stream_uri)?;
        debug!("Registering stream '{}' with video gateway", name);

        let res = self.client.put(url).send().await?;
        if !res.status().is_success() {
            return Err(EdgeError::device(format!(
                "Video gateway rejected stream '{}': {}", name, res.status()
            )));
        }
        info!("Camera {} registered with video gateway as '{}'", camera_id, name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_streams_url_encodes_source() {
        let gateway = VideoGateway::new(&GatewayConfig { base_url: "http://127.0.0.1:1984/".into() }).unwrap();
        let url = gateway.streams_url("camera_3", "rtsp://admin:pw@10.0.0.5/h264?ch=1").unwrap();
        assert_eq!(url.path(), "/api/streams");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs[0], ("name".to_string(), "camera_3".to_string()));
        assert_eq!(pairs[1].1, "rtsp://admin:pw@10.0.0.5/h264?ch=1");
    }
}
