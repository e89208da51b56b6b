//! ONVIF SOAP responder for `/onvif/device_service` and
//! `/onvif/media_service`. Ports `respond_request()`'s ONVIF branch: action
//! extraction from the SOAP body, WS-Security auth gate, and a
//! minimal Profile S response set (capabilities, device info, system time,
//! media profiles, snapshot/stream URIs, video sources).

use std::fmt::Write as _;

use super::server::{AppState, Request};

/// Escapes text for XML PCDATA, the way `scottlamb-moonfire-playground`'s
/// ONVIF client escapes outgoing element content.
struct EscapedText<'a>(&'a str);

impl std::fmt::Display for EscapedText<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        for c in self.0.chars() {
            match c {
                '<' => f.write_str("&lt;")?,
                '&' => f.write_str("&amp;")?,
                '>' => f.write_str("&gt;")?,
                '"' => f.write_str("&quot;")?,
                _ => f.write_char(c)?,
            }
        }
        Ok(())
    }
}

pub fn handle(state: &AppState, request: &Request) -> String {
    let path = request.uri.strip_prefix("/onvif").unwrap_or("").trim_start_matches('/');
    let payload = String::from_utf8_lossy(&request.payload);

    let action = extract_soap_action(&payload);

    if state.config.read().onvif.enable_auth && !validate_soap_auth(&payload, state) {
        return unauthorized_response();
    }

    let body = match (path, action.as_deref()) {
        ("device_service", Some("GetCapabilities")) => respond_capabilities(state),
        ("device_service", Some("GetDeviceInformation")) => respond_device_info(),
        ("device_service", Some("GetSystemDateAndTime")) => respond_system_time(),
        ("media_service", Some("GetProfiles")) => respond_media_profiles(state),
        ("media_service", Some("GetSnapshotUri")) => respond_snapshot_uri(state),
        ("media_service", Some("GetStreamUri")) => respond_stream_uri(state),
        ("media_service", Some("GetVideoSources")) => respond_video_sources(state),
        _ => {
            if let Some(action) = action {
                tracing::warn!(path, action, "unknown onvif request");
            }
            return not_implemented_response();
        }
    };

    soap_response(200, "OK", &body)
}

fn extract_soap_action(payload: &str) -> Option<String> {
    let doc = roxmltree::Document::parse(payload).ok()?;
    let body = doc.descendants().find(|n| n.has_tag_name("Body"))?;
    let action_element = body.children().find(|n| n.is_element())?;
    Some(action_element.tag_name().name().to_string())
}

fn validate_soap_auth(payload: &str, state: &AppState) -> bool {
    let Ok(doc) = roxmltree::Document::parse(payload) else { return false };
    let Some(username_node) = doc.descendants().find(|n| n.has_tag_name("Username")) else { return false };
    let Some(username) = username_node.text() else { return false };
    username == state.config.read().onvif.auth_user
}

fn soap_envelope(body: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
<s:Envelope xmlns:s=\"http://www.w3.org/2003/05/soap-envelope\">\
<s:Body>{body}</s:Body></s:Envelope>"
    )
}

fn soap_response(code: u16, reason: &str, body: &str) -> String {
    let envelope = soap_envelope(body);
    format!(
        "HTTP/1.1 {code} {reason}\r\nContent-Type: application/soap+xml\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{envelope}",
        envelope.len()
    )
}

fn unauthorized_response() -> String {
    let body = "Sender not Authorized";
    format!(
        "HTTP/1.1 401 Unauthorized\r\nContent-Type: text/plain\r\n\
        WWW-Authenticate: Digest realm=\"Access the camera services\"\r\nConnection: close\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    )
}

fn not_implemented_response() -> String {
    let body = "Not Implemented";
    format!("HTTP/1.1 501 Not Implemented\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}", body.len())
}

fn respond_capabilities(state: &AppState) -> String {
    let host = state.config.read().system.web_bind.clone();
    let port = state.config.read().system.web_port;
    let base = format!("http://{}:{port}/onvif", if host.is_empty() { "0.0.0.0" } else { &host });
    format!(
        "<tds:GetCapabilitiesResponse xmlns:tds=\"http://www.onvif.org/ver10/device/wsdl\" xmlns:tt=\"http://www.onvif.org/ver10/schema\">\
<tds:Capabilities><tt:Device><tt:XAddr>{base}/device_service</tt:XAddr></tt:Device>\
<tt:Media><tt:XAddr>{base}/media_service</tt:XAddr></tt:Media></tds:Capabilities></tds:GetCapabilitiesResponse>"
    )
}

fn respond_device_info() -> String {
    "<tds:GetDeviceInformationResponse xmlns:tds=\"http://www.onvif.org/ver10/device/wsdl\">\
<tds:Manufacturer>camerad</tds:Manufacturer><tds:Model>camerad</tds:Model>\
<tds:FirmwareVersion>1.0</tds:FirmwareVersion><tds:SerialNumber>0</tds:SerialNumber>\
<tds:HardwareId>0</tds:HardwareId></tds:GetDeviceInformationResponse>"
        .to_string()
}

fn respond_system_time() -> String {
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    format!(
        "<tds:GetSystemDateAndTimeResponse xmlns:tds=\"http://www.onvif.org/ver10/device/wsdl\">\
<tds:SystemDateAndTime><tds:UTCDateTime><tds:Time>{}</tds:Time></tds:UTCDateTime></tds:SystemDateAndTime>\
</tds:GetSystemDateAndTimeResponse>",
        now.as_secs()
    )
}

fn respond_media_profiles(state: &AppState) -> String {
    let config = state.config.read();
    let profile_name = EscapedText(&config.system.sensor_config);
    format!(
        "<trt:GetProfilesResponse xmlns:trt=\"http://www.onvif.org/ver10/media/wsdl\">\
<trt:Profiles token=\"profile_0\" fixed=\"true\"><tt:Name xmlns:tt=\"http://www.onvif.org/ver10/schema\">{profile_name}</tt:Name>\
</trt:Profiles></trt:GetProfilesResponse>"
    )
}

fn respond_snapshot_uri(state: &AppState) -> String {
    let port = state.config.read().system.web_port;
    format!(
        "<trt:GetSnapshotUriResponse xmlns:trt=\"http://www.onvif.org/ver10/media/wsdl\">\
<trt:MediaUri xmlns:tt=\"http://www.onvif.org/ver10/schema\"><tt:Uri>http://0.0.0.0:{port}/image.jpg</tt:Uri>\
</trt:MediaUri></trt:GetSnapshotUriResponse>"
    )
}

fn respond_stream_uri(state: &AppState) -> String {
    let config = state.config.read();
    let ext = if config.mp4.codec_h265 { "265" } else { "264" };
    let port = config.system.web_port;
    format!(
        "<trt:GetStreamUriResponse xmlns:trt=\"http://www.onvif.org/ver10/media/wsdl\">\
<trt:MediaUri xmlns:tt=\"http://www.onvif.org/ver10/schema\"><tt:Uri>http://0.0.0.0:{port}/video.{ext}</tt:Uri>\
</trt:MediaUri></trt:GetStreamUriResponse>"
    )
}

fn respond_video_sources(state: &AppState) -> String {
    let config = state.config.read();
    format!(
        "<tds:GetVideoSourcesResponse xmlns:tds=\"http://www.onvif.org/ver10/device/wsdl\">\
<tds:VideoSources token=\"video_src_0\"><tt:Resolution xmlns:tt=\"http://www.onvif.org/ver10/schema\">\
<tt:Width>{}</tt:Width><tt:Height>{}</tt:Height></tt:Resolution></tds:VideoSources></tds:GetVideoSourcesResponse>",
        config.mp4.width, config.mp4.height
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_reserved_xml_characters() {
        assert_eq!(EscapedText("<a&b>\"c\"").to_string(), "&lt;a&amp;b&gt;&quot;c&quot;");
    }

    #[test]
    fn extracts_action_from_soap_body() {
        let payload = "<s:Envelope xmlns:s=\"http://www.w3.org/2003/05/soap-envelope\">\
            <s:Body><tds:GetCapabilities xmlns:tds=\"x\"/></s:Body></s:Envelope>";
        assert_eq!(extract_soap_action(payload).as_deref(), Some("GetCapabilities"));
    }
}
