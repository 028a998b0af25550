use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use chrono::Utc;
use sha1::{Digest, Sha1};
use std::time::Duration;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::config::Credentials;
use crate::database::CameraEndpoint;
use crate::errors::{EdgeError, Result};

const SOAP_DEVICE_NS: &str = "http://www.onvif.org/ver10/device/wsdl";
const SOAP_MEDIA_NS: &str = "http://www.onvif.org/ver10/media/wsdl";

/// An authenticated session with one camera
#[async_trait]
pub trait CameraDevice: Send + Sync {
    /// Any idempotent read; an error demotes the camera from the connected set
    async fn liveness(&self) -> Result<()>;
    async fn stream_uri(&self) -> Result<String>;
}

#[async_trait]
pub trait DeviceConnector: Send + Sync {
    /// Opens a session and performs the warm-up handshake
    async fn connect(&self, endpoint: &CameraEndpoint, credentials: Option<&Credentials>) -> Result<Box<dyn CameraDevice>>;
}

#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    pub media_xaddr: Option<String>,
    pub ptz_xaddr: Option<String>,
}

#[derive(Clone)]
pub struct OnvifDevice {
    pub device_url: String,
    pub media_url: String,
    credentials: Option<Credentials>,
    client: reqwest::Client,
}

impl OnvifDevice {
    pub fn new(endpoint: &CameraEndpoint, credentials: Option<Credentials>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(timeout)
            .build()?;
        Ok(Self {
            device_url: format!("http://{}:{}/onvif/device_service", endpoint.ip, endpoint.port),
            media_url: format!("http://{}:{}/onvif/media_service", endpoint.ip, endpoint.port),
            credentials,
            client,
        })
    }

    fn envelope(&self, body: &str) -> String {
        let header = self.credentials.as_ref()
            .filter(|c| !c.username.is_empty())
            .map(|c| format!("<s:Header>{}</s:Header>", wsse_header(&c.username, &c.password)))
            .unwrap_or_default();
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
             <s:Envelope xmlns:s=\"http://www.w3.org/2003/05/soap-envelope\"\n\
              xmlns:tt=\"http://www.onvif.org/ver10/schema\"\n\
              xmlns:tds=\"{}\"\n\
              xmlns:trt=\"{}\">\n\
               {}\n\
               <s:Body>{}</s:Body>\n\
             </s:Envelope>",
            SOAP_DEVICE_NS, SOAP_MEDIA_NS, header, body
        )
    }

    async fn post(&self, url: &str, action: &str, body: &str) -> Result<String> {
        debug!(target: "onvif", action = action, endpoint = %url, "Sending ONVIF request");
        let res = self.client.post(url)
            .header("Content-Type", "application/soap+xml; charset=utf-8")
            .header("SOAPAction", action)
            .body(self.envelope(body))
            .send()
            .await
            .map_err(|e| EdgeError::device(format!("ONVIF HTTP error at {}: {}", url, e)))?;
        let status = res.status();
        let text = res.text().await.unwrap_or_default();
        trace!(target: "onvif", action = action, endpoint = %url, response = %text, "ONVIF response body");
        if !status.is_success() {
            return Err(EdgeError::device(format!("ONVIF {} returned {}", action, status)));
        }
        if text.contains(":Fault>") {
            let reason = extract_xml_value(&text, "Text").unwrap_or_else(|| "SOAP fault".to_string());
            return Err(EdgeError::device(format!("ONVIF {} fault: {}", action, reason)));
        }
        Ok(text)
    }

    /// Unauthenticated on most devices, used as the liveness read
    pub async fn get_system_date_and_time(&self) -> Result<String> {
        let body = "<tds:GetSystemDateAndTime/>";
        let xml = self.post(&self.device_url, &format!("{}/GetSystemDateAndTime", SOAP_DEVICE_NS), body).await?;
        Ok(extract_xml_value(&xml, "Year").unwrap_or_default())
    }

    pub async fn get_capabilities(&self) -> Result<Capabilities> {
        let body = "<tds:GetCapabilities><tds:Category>All</tds:Category></tds:GetCapabilities>";
        let xml = self.post(&self.device_url, &format!("{}/GetCapabilities", SOAP_DEVICE_NS), body).await?;
        Ok(Capabilities {
            media_xaddr: extract_capability_xaddr(&xml, "Media"),
            ptz_xaddr: extract_capability_xaddr(&xml, "PTZ"),
        })
    }

    pub async fn get_profiles(&self) -> Result<Vec<String>> {
        let body = "<trt:GetProfiles/>";
        let xml = self.post(&self.media_url, &format!("{}/GetProfiles", SOAP_MEDIA_NS), body).await?;
        Ok(extract_profile_tokens(&xml))
    }

    pub async fn get_stream_uri(&self, profile_token: &str) -> Result<String> {
        let body = format!(
            "<trt:GetStreamUri>\n\
                <trt:StreamSetup>\n\
                    <tt:Stream>RTP-Unicast</tt:Stream>\n\
                    <tt:Transport><tt:Protocol>RTSP</tt:Protocol></tt:Transport>\n\
                </trt:StreamSetup>\n\
                <trt:ProfileToken>{}</trt:ProfileToken>\n\
             </trt:GetStreamUri>",
            xml_escape(profile_token)
        );
        let xml = self.post(&self.media_url, &format!("{}/GetStreamUri", SOAP_MEDIA_NS), &body).await?;
        extract_xml_value(&xml, "Uri")
            .ok_or_else(|| EdgeError::device(format!("No stream URI in GetStreamUri response for profile {}", profile_token)))
    }
}

#[async_trait]
impl CameraDevice for OnvifDevice {
    async fn liveness(&self) -> Result<()> {
        self.get_system_date_and_time().await.map(|_| ())
    }

    async fn stream_uri(&self) -> Result<String> {
        let profiles = self.get_profiles().await?;
        let first = profiles.first()
            .ok_or_else(|| EdgeError::device(format!("Device {} reports no media profiles", self.device_url)))?;
        let uri = self.get_stream_uri(first).await?;
        match &self.credentials {
            Some(creds) => inject_credentials(&uri, creds),
            None => Ok(uri),
        }
    }
}

pub struct OnvifConnector {
    timeout: Duration,
}

impl OnvifConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl DeviceConnector for OnvifConnector {
    async fn connect(&self, endpoint: &CameraEndpoint, credentials: Option<&Credentials>) -> Result<Box<dyn CameraDevice>> {
        let mut device = OnvifDevice::new(endpoint, credentials.cloned(), self.timeout)?;
        // GetCapabilities requires authentication, so it doubles as the credential check
        let capabilities = device.get_capabilities().await?;
        if let Some(media) = capabilities.media_xaddr {
            device.media_url = media;
        }
        debug!("ONVIF session established with {} (media at {})", endpoint, device.media_url);
        Ok(Box::new(device))
    }
}

pub fn wsse_header(username: &str, password: &str) -> String {
    let nonce_bytes = *Uuid::new_v4().as_bytes();
    let created = Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
    let digest = password_digest(&nonce_bytes, &created, password);

    format!(
        "<wsse:Security s:mustUnderstand=\"1\"\n\
            xmlns:wsse=\"http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd\"\n\
            xmlns:wsu=\"http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-utility-1.0.xsd\">\n\
            <wsse:UsernameToken>\n\
                <wsse:Username>{}</wsse:Username>\n\
                <wsse:Password Type=\"http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-username-token-profile-1.0#PasswordDigest\">{}</wsse:Password>\n\
                <wsse:Nonce EncodingType=\"http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-soap-message-security-1.0#Base64Binary\">{}</wsse:Nonce>\n\
                <wsu:Created>{}</wsu:Created>\n\
            </wsse:UsernameToken>\n\
        </wsse:Security>",
        xml_escape(username), digest, B64.encode(nonce_bytes), created
    )
}

/// Base64(SHA1(nonce + created + password))
pub fn password_digest(nonce: &[u8], created: &str, password: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(nonce);
    hasher.update(created.as_bytes());
    hasher.update(password.as_bytes());
    B64.encode(hasher.finalize())
}

pub fn inject_credentials(uri: &str, credentials: &Credentials) -> Result<String> {
    let mut url = url::Url::parse(uri)?;
    if url.username().is_empty() {
        url.set_username(&credentials.username)
            .map_err(|_| EdgeError::device(format!("Cannot set credentials on URI {}", uri)))?;
        url.set_password(Some(&credentials.password))
            .map_err(|_| EdgeError::device(format!("Cannot set credentials on URI {}", uri)))?;
    }
    Ok(url.to_string())
}

pub fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Namespace-agnostic text content of the first `tag` element
pub fn extract_xml_value(xml: &str, tag: &str) -> Option<String> {
    let patterns = [format!(":{}>", tag), format!("<{}>", tag)];
    for pattern in &patterns {
        let mut search_from = 0;
        while let Some(found) = xml[search_from..].find(pattern.as_str()) {
            let start = search_from + found;
            search_from = start + pattern.len();
            // skip closing tags such as </tt:Uri>
            let tag_open = xml[..start].rfind('<').unwrap_or(0);
            if xml[tag_open..].starts_with("</") {
                continue;
            }
            let content_start = start + pattern.len();
            if let Some(end) = xml[content_start..].find("</") {
                let value = xml[content_start..content_start + end].trim().to_string();
                if !value.is_empty() {
                    return Some(value);
                }
            }
        }
    }
    None
}

pub fn extract_capability_xaddr(xml: &str, capability: &str) -> Option<String> {
    // the next occurrence of the same pattern is the closing tag
    let pattern = format!(":{}>", capability);
    let start = xml.find(pattern.as_str())? + pattern.len();
    let section = &xml[start..];
    let end = section.find(pattern.as_str()).unwrap_or(section.len());
    extract_xml_value(&section[..end], "XAddr")
}

pub fn extract_profile_tokens(xml: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut rest = xml;
    while let Some(idx) = rest.find(":Profiles") {
        let after = &rest[idx + ":Profiles".len()..];
        let tag_end = after.find('>').unwrap_or(after.len());
        let attrs = &after[..tag_end];
        if let Some(token_at) = attrs.find("token=") {
            let value = &attrs[token_at + "token=".len()..];
            let quote = if value.starts_with('\'') { '\'' } else { '"' };
            let value = value.trim_start_matches(quote);
            if let Some(end) = value.find(quote) {
                tokens.push(value[..end].to_string());
            }
        }
        rest = &after[tag_end..];
    }
    tokens
}
