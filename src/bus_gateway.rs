use std::future::Future;

use crate::discovery::Candidate;
use crate::snapshot::DeviceValues;

/// Read side of the shared device bus.
pub trait DeviceBus: Send + Sync + 'static {
    /// Every service currently on the bus, classified or not.
    fn list_candidates(&self) -> impl Future<Output = anyhow::Result<Vec<Candidate>>> + Send;

    /// Current `path -> value` map of one service.
    fn read_values(&self, address: &str) -> impl Future<Output = anyhow::Result<DeviceValues>> + Send;
}

/// HTTP/JSON gateway in front of the device bus.
pub struct HttpGateway {
    endpoint_url: String,
    auth_token: String,
    client: reqwest::Client,
}

impl HttpGateway {
    pub fn new(endpoint_url: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            endpoint_url: endpoint_url.into().trim_end_matches('/').to_string(),
            auth_token: auth_token.into(),
            client: reqwest::Client::new(),
        }
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> anyhow::Result<T> {
        if self.endpoint_url.is_empty() {
            anyhow::bail!("No bus gateway configured");
        }
        let mut request = self.client.get(format!("{}{}", self.endpoint_url, path));
        if !self.auth_token.is_empty() {
            request = request.bearer_auth(&self.auth_token);
        }
        let result = request.send().await?.error_for_status()?.json().await?;
        Ok(result)
    }
}

impl DeviceBus for HttpGateway {
    async fn list_candidates(&self) -> anyhow::Result<Vec<Candidate>> {
        self.get("/api/services").await
    }

    async fn read_values(&self, address: &str) -> anyhow::Result<DeviceValues> {
        self.get(&format!("/api/services/{address}/values")).await
    }
}


#[cfg(test)]
mod test_gateway {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_list_candidates() {
        let mut server = mockito::Server::new_async().await;

        let mock = server
            .mock("GET", "/api/services")
            .match_header("Authorization", "Bearer test_token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"
                [
                    {
                        "address": "com.victronenergy.battery.ttyS5",
                        "product_id": 41865,
                        "product_name": "SmartShunt 500A/50mV",
                        "custom_name": "House",
                        "device_instance": 277,
                        "firmware_version": 1049,
                        "unit_id": 226
                    },
                    {
                        "address": "com.victronenergy.system"
                    }
                ]
            "#,
            )
            .create_async()
            .await;

        let gateway = HttpGateway::new(server.url(), "test_token");
        let candidates = gateway.list_candidates().await.unwrap();

        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].product_id, Some(0xA389));
        assert_eq!(candidates[0].custom_name.as_deref(), Some("House"));
        assert_eq!(candidates[0].device_instance, Some(277));
        assert_eq!(candidates[0].unit_id, Some(226));
        assert_eq!(candidates[1].address, "com.victronenergy.system");
        assert_eq!(candidates[1].device_instance, None);

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_read_values() {
        let mut server = mockito::Server::new_async().await;

        let mock = server
            .mock("GET", "/api/services/com.victronenergy.battery.ttyS5/values")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "/Dc/0/Voltage": 13.2,
                    "/Dc/0/Temperature": null,
                    "/TimeToGo": []
                })
                .to_string(),
            )
            .create_async()
            .await;

        let gateway = HttpGateway::new(format!("{}/", server.url()), "");
        let values = gateway.read_values("com.victronenergy.battery.ttyS5").await.unwrap();

        assert_eq!(values["/Dc/0/Voltage"], json!(13.2));
        assert!(values["/Dc/0/Temperature"].is_null());
        assert_eq!(values["/TimeToGo"], json!([]));

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_error_status_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/services/gone/values")
            .with_status(404)
            .create_async()
            .await;

        let gateway = HttpGateway::new(server.url(), "");
        assert!(gateway.read_values("gone").await.is_err());
    }

    #[tokio::test]
    async fn test_no_gateway_configured() {
        let gateway = HttpGateway::new("", "");
        let result = gateway.list_candidates().await;
        assert_eq!(result.unwrap_err().to_string(), "No bus gateway configured");
    }
}
