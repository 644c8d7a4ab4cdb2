//! Best-effort UPnP port mapping against the local internet gateway.
//!
//! Discovers an IGD over SSDP, then drives the WANIPConnection (or
//! WANPPPConnection) service over plain SOAP: refresh the UDP mapping for
//! the VPN's listen port and read back the gateway's external address. When
//! that address disagrees with the VPN's advertised endpoint the corrected
//! VPN is returned so the caller can write it back to the control plane.

use std::net::IpAddr;
use std::time::Duration;

use quick_xml::events::Event;
use quick_xml::Reader;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::AdapterError;
use crate::model::Vpn;
use crate::util;

const SSDP_ADDR: &str = "239.255.255.250:1900";
const SERVICE_TYPES: &[&str] = &[
    "urn:schemas-upnp-org:service:WANIPConnection:1",
    "urn:schemas-upnp-org:service:WANPPPConnection:1",
];
const DISCOVER_WINDOW: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
struct Gateway {
    service_type: String,
    control_url: String,
}

pub struct UpnpMapper {
    http: reqwest::Client,
}

impl Default for UpnpMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl UpnpMapper {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("failed to build UPnP HTTP client");
        Self { http }
    }

    /// Reconcile the gateway mapping for this VPN's listen port.
    ///
    /// Returns a corrected VPN when the gateway's external address differs
    /// from the advertised endpoint and `syncEndpoint` does not forbid the
    /// write-back.
    pub async fn configure(&self, vpn: &Vpn) -> Result<Option<Vpn>, AdapterError> {
        if !vpn.current.upnp {
            return Ok(None);
        }
        if vpn.current.listen_port == 0 || vpn.current.endpoint.is_empty() {
            return Ok(None);
        }
        let Some(IpAddr::V4(local_ip)) = util::outbound_ip() else {
            warn!("no local IPv4 address, skipping UPnP");
            return Ok(None);
        };

        let gateways = self.discover().await?;
        if gateways.is_empty() {
            debug!("no internet gateway found, UPnP likely unsupported");
            return Ok(None);
        }

        let mut corrected: Option<Vpn> = None;
        for gw in &gateways {
            match self.external_ip(gw).await {
                Ok(external) => {
                    let endpoint_host = vpn
                        .current
                        .endpoint
                        .rsplit_once(':')
                        .map(|(host, _)| host)
                        .unwrap_or(&vpn.current.endpoint);
                    if endpoint_host != external && !util::is_bogon(&external) {
                        info!(
                            vpn = %vpn.name,
                            %external,
                            endpoint = %vpn.current.endpoint,
                            "external address does not match endpoint"
                        );
                        if !vpn.current.sync_endpoint && corrected.is_none() {
                            let port = vpn
                                .current
                                .endpoint
                                .rsplit_once(':')
                                .map(|(_, p)| p)
                                .unwrap_or("51820");
                            let mut updated = vpn.clone();
                            updated.current.endpoint = format!("{external}:{port}");
                            corrected = Some(updated);
                        }
                    }
                }
                Err(e) => warn!(error = %e, "failed to read external address"),
            }

            // Old mappings for the port can shadow the new one.
            if let Err(e) = self.delete_mapping(gw, vpn.current.listen_port as u16).await {
                debug!(error = %e, "delete port mapping failed");
            }
            let description = format!("{}-{}", vpn.name, vpn.net_name);
            match self
                .add_mapping(gw, vpn.current.listen_port as u16, local_ip, &description)
                .await
            {
                Ok(()) => info!(
                    vpn = %vpn.name,
                    port = vpn.current.listen_port,
                    "UPnP mapping refreshed"
                ),
                Err(e) => warn!(error = %e, "add port mapping failed"),
            }
        }

        Ok(corrected)
    }

    /// SSDP M-SEARCH for WAN connection services, then fetch each device
    /// description to find the SOAP control URL.
    async fn discover(&self) -> Result<Vec<Gateway>, AdapterError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let mut locations = Vec::new();
        for st in SERVICE_TYPES {
            let msearch = format!(
                "M-SEARCH * HTTP/1.1\r\nHOST: {SSDP_ADDR}\r\nMAN: \"ssdp:discover\"\r\nMX: 2\r\nST: {st}\r\n\r\n"
            );
            if socket.send_to(msearch.as_bytes(), SSDP_ADDR).await.is_err() {
                continue;
            }
            let mut buf = [0u8; 2048];
            let deadline = tokio::time::Instant::now() + DISCOVER_WINDOW;
            loop {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                if remaining.is_zero() {
                    break;
                }
                match timeout(remaining, socket.recv_from(&mut buf)).await {
                    Ok(Ok((len, _))) => {
                        let response = String::from_utf8_lossy(&buf[..len]);
                        if let Some(location) = parse_ssdp_location(&response) {
                            if !locations.contains(&location) {
                                locations.push(location);
                            }
                        }
                    }
                    _ => break,
                }
            }
        }

        let mut gateways = Vec::new();
        for location in locations {
            let xml = match self.http.get(&location).send().await {
                Ok(resp) => match resp.text().await {
                    Ok(text) => text,
                    Err(_) => continue,
                },
                Err(_) => continue,
            };
            if let Some((service_type, control_path)) = find_wan_service(&xml) {
                if let Ok(base) = url::Url::parse(&location) {
                    if let Ok(control) = base.join(&control_path) {
                        gateways.push(Gateway {
                            service_type,
                            control_url: control.to_string(),
                        });
                    }
                }
            }
        }
        Ok(gateways)
    }

    async fn soap(
        &self,
        gw: &Gateway,
        action: &str,
        arguments: &str,
    ) -> Result<String, AdapterError> {
        let body = format!(
            "<?xml version=\"1.0\"?>\
             <s:Envelope xmlns:s=\"http://schemas.xmlsoap.org/soap/envelope/\" \
             s:encodingStyle=\"http://schemas.xmlsoap.org/soap/encoding/\">\
             <s:Body><u:{action} xmlns:u=\"{st}\">{arguments}</u:{action}></s:Body>\
             </s:Envelope>",
            st = gw.service_type,
        );
        let response = self
            .http
            .post(&gw.control_url)
            .header("Content-Type", "text/xml; charset=\"utf-8\"")
            .header("SOAPAction", format!("\"{}#{}\"", gw.service_type, action))
            .body(body)
            .send()
            .await
            .map_err(|e| AdapterError::Command {
                command: format!("upnp {action}"),
                detail: e.to_string(),
            })?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(AdapterError::Command {
                command: format!("upnp {action}"),
                detail: format!("HTTP {status}: {text}"),
            });
        }
        Ok(text)
    }

    async fn external_ip(&self, gw: &Gateway) -> Result<String, AdapterError> {
        let xml = self.soap(gw, "GetExternalIPAddress", "").await?;
        tag_text(&xml, "NewExternalIPAddress").ok_or_else(|| AdapterError::Command {
            command: "upnp GetExternalIPAddress".into(),
            detail: "no address in response".into(),
        })
    }

    async fn delete_mapping(&self, gw: &Gateway, port: u16) -> Result<(), AdapterError> {
        let args = format!(
            "<NewRemoteHost></NewRemoteHost>\
             <NewExternalPort>{port}</NewExternalPort>\
             <NewProtocol>UDP</NewProtocol>"
        );
        self.soap(gw, "DeletePortMapping", &args).await.map(|_| ())
    }

    async fn add_mapping(
        &self,
        gw: &Gateway,
        port: u16,
        local_ip: std::net::Ipv4Addr,
        description: &str,
    ) -> Result<(), AdapterError> {
        let args = format!(
            "<NewRemoteHost></NewRemoteHost>\
             <NewExternalPort>{port}</NewExternalPort>\
             <NewProtocol>UDP</NewProtocol>\
             <NewInternalPort>{port}</NewInternalPort>\
             <NewInternalClient>{local_ip}</NewInternalClient>\
             <NewEnabled>1</NewEnabled>\
             <NewPortMappingDescription>{description}</NewPortMappingDescription>\
             <NewLeaseDuration>0</NewLeaseDuration>"
        );
        self.soap(gw, "AddPortMapping", &args).await.map(|_| ())
    }
}

fn parse_ssdp_location(response: &str) -> Option<String> {
    response.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim().eq_ignore_ascii_case("location") {
            Some(value.trim().to_string())
        } else {
            None
        }
    })
}

/// Walk the IGD device description looking for a WAN connection service,
/// returning its type and control URL.
fn find_wan_service(xml: &str) -> Option<(String, String)> {
    let mut reader = Reader::from_str(xml);

    let mut current_tag = String::new();
    let mut service_type = String::new();
    let mut control_url = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                current_tag = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                if current_tag == "service" {
                    service_type.clear();
                    control_url.clear();
                }
            }
            Ok(Event::Text(t)) => {
                let text = t.unescape().unwrap_or_default().trim().to_string();
                if text.is_empty() {
                    continue;
                }
                match current_tag.as_str() {
                    "serviceType" => service_type = text,
                    "controlURL" => control_url = text,
                    _ => {}
                }
            }
            Ok(Event::End(e)) => {
                if e.local_name().as_ref() == b"service"
                    && SERVICE_TYPES.iter().any(|st| *st == service_type)
                    && !control_url.is_empty()
                {
                    return Some((service_type, control_url));
                }
                current_tag.clear();
            }
            Ok(Event::Eof) => return None,
            Err(_) => return None,
            _ => {}
        }
    }
}

fn tag_text(xml: &str, tag: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    let mut inside = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                inside = e.local_name().as_ref() == tag.as_bytes();
            }
            Ok(Event::Text(t)) if inside => {
                let text = t.unescape().unwrap_or_default().trim().to_string();
                if !text.is_empty() {
                    return Some(text);
                }
            }
            Ok(Event::End(_)) => inside = false,
            Ok(Event::Eof) => return None,
            Err(_) => return None,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ssdp_location_header() {
        let response = "HTTP/1.1 200 OK\r\nCACHE-CONTROL: max-age=120\r\nLOCATION: http://192.168.1.1:5000/rootDesc.xml\r\nST: urn:schemas-upnp-org:service:WANIPConnection:1\r\n\r\n";
        assert_eq!(
            parse_ssdp_location(response).as_deref(),
            Some("http://192.168.1.1:5000/rootDesc.xml")
        );
        assert_eq!(parse_ssdp_location("HTTP/1.1 200 OK\r\n\r\n"), None);
    }

    #[test]
    fn finds_wan_service_control_url() {
        let xml = r#"<root>
            <device><serviceList>
              <service>
                <serviceType>urn:schemas-upnp-org:service:Layer3Forwarding:1</serviceType>
                <controlURL>/l3f</controlURL>
              </service>
              <service>
                <serviceType>urn:schemas-upnp-org:service:WANIPConnection:1</serviceType>
                <controlURL>/ctl/IPConn</controlURL>
              </service>
            </serviceList></device>
        </root>"#;
        let (st, url) = find_wan_service(xml).unwrap();
        assert_eq!(st, "urn:schemas-upnp-org:service:WANIPConnection:1");
        assert_eq!(url, "/ctl/IPConn");
    }

    #[test]
    fn reads_external_ip_from_soap_response() {
        let xml = r#"<s:Envelope><s:Body>
            <u:GetExternalIPAddressResponse>
              <NewExternalIPAddress>203.0.113.7</NewExternalIPAddress>
            </u:GetExternalIPAddressResponse>
        </s:Body></s:Envelope>"#;
        assert_eq!(
            tag_text(xml, "NewExternalIPAddress").as_deref(),
            Some("203.0.113.7")
        );
    }
}
