//! Values-API workbook client

use super::backend::{column_letter, CellRange, SheetBackend};
use crate::error::{ConfigError, RemoteError, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Body of a values-API response; trailing blank cells are omitted upstream
#[derive(Debug, Default, Deserialize, Serialize)]
struct ValueRange {
    #[serde(default)]
    range: Option<String>,
    #[serde(default)]
    values: Vec<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct Credentials {
    access_token: String,
}

/// Workbook served over the spreadsheet values API
pub struct HttpWorkbook {
    client: Client,
    base_url: Url,
    spreadsheet_id: String,
    token: String,
}

impl HttpWorkbook {
    /// Create a client; the credential file holds either a JSON object with
    /// an `access_token` field or the bare token
    pub fn new(endpoint: &str, spreadsheet_id: &str, credentials: &Path) -> Result<Self> {
        if !credentials.exists() {
            return Err(ConfigError::MissingCredentials(credentials.to_path_buf()).into());
        }
        let raw = std::fs::read_to_string(credentials)
            .map_err(|e| crate::error::Error::store(credentials, e))?;
        let token = match serde_json::from_str::<Credentials>(&raw) {
            Ok(c) => c.access_token,
            Err(_) => raw.trim().to_string(),
        };
        if token.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "credential file {} holds no token",
                credentials.display()
            ))
            .into());
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(RemoteError::from)?;

        let base_url = Url::parse(endpoint)
            .map_err(|e| ConfigError::Invalid(format!("sheets endpoint {endpoint:?}: {e}")))?;

        Ok(Self {
            client,
            base_url,
            spreadsheet_id: spreadsheet_id.to_string(),
            token,
        })
    }

    fn values_url(&self, range: &str) -> std::result::Result<Url, RemoteError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| RemoteError::Response(format!("endpoint {} cannot be a base", self.base_url)))?
            .pop_if_empty()
            .extend(["v4", "spreadsheets", &self.spreadsheet_id, "values", range]);
        Ok(url)
    }

    async fn get_values(
        &self,
        sheet: &str,
        a1: &str,
        by_columns: bool,
    ) -> std::result::Result<Vec<Vec<String>>, RemoteError> {
        let mut url = self.values_url(&format!("'{}'!{}", sheet, a1))?;
        if by_columns {
            url.query_pairs_mut().append_pair("majorDimension", "COLUMNS");
        }

        debug!(url = %url, "GET values");
        let response = self.client.get(url).bearer_auth(&self.token).send().await?;
        let body: ValueRange = check(sheet, response).await?.json().await?;
        Ok(body.values)
    }
}

async fn check(
    sheet: &str,
    response: reqwest::Response,
) -> std::result::Result<reqwest::Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if status == StatusCode::BAD_REQUEST && body.contains("Unable to parse range") {
        return Err(RemoteError::SheetNotFound(sheet.to_string()));
    }
    Err(RemoteError::Response(format!("API error ({}): {}", status, body)))
}

fn pad(mut rows: Vec<Vec<String>>, height: usize, width: usize) -> Vec<Vec<String>> {
    rows.resize_with(height, Vec::new);
    for row in &mut rows {
        row.resize(width, String::new());
    }
    rows
}

#[async_trait]
impl SheetBackend for HttpWorkbook {
    async fn row_values(&self, sheet: &str, row: usize) -> std::result::Result<Vec<String>, RemoteError> {
        let values = self.get_values(sheet, &format!("{row}:{row}"), false).await?;
        Ok(values.into_iter().next().unwrap_or_default())
    }

    async fn col_values(&self, sheet: &str, col: usize) -> std::result::Result<Vec<String>, RemoteError> {
        let letter = column_letter(col);
        let values = self
            .get_values(sheet, &format!("{letter}:{letter}"), true)
            .await?;
        Ok(values.into_iter().next().unwrap_or_default())
    }

    async fn range(
        &self,
        sheet: &str,
        range: CellRange,
    ) -> std::result::Result<Vec<Vec<String>>, RemoteError> {
        let values = self.get_values(sheet, &range.to_a1(), false).await?;
        Ok(pad(values, range.height(), range.width()))
    }

    async fn update_cell(
        &self,
        sheet: &str,
        row: usize,
        col: usize,
        value: &str,
    ) -> std::result::Result<(), RemoteError> {
        let a1 = format!("{}{}", column_letter(col), row);
        let mut url = self.values_url(&format!("'{}'!{}", sheet, a1))?;
        url.query_pairs_mut().append_pair("valueInputOption", "RAW");

        let body = ValueRange {
            range: None,
            values: vec![vec![value.to_string()]],
        };

        debug!(url = %url, value = %value, "PUT value");
        let response = self
            .client
            .put(url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;
        check(sheet, response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use tempfile::TempDir;

    fn workbook(dir: &TempDir, endpoint: &str) -> HttpWorkbook {
        let key = dir.path().join("key.json");
        std::fs::write(&key, r#"{ "access_token": "secret" }"#).unwrap();
        HttpWorkbook::new(endpoint, "sheet0123456789", &key).unwrap()
    }

    #[test]
    fn test_missing_credentials() {
        let dir = TempDir::new().unwrap();
        let result = HttpWorkbook::new(
            "https://sheets.example.com",
            "sheet0123456789",
            &dir.path().join("key.json"),
        );
        assert!(matches!(
            result,
            Err(crate::error::Error::Config(ConfigError::MissingCredentials(_)))
        ));
    }

    #[test]
    fn test_bare_token_file() {
        let dir = TempDir::new().unwrap();
        let key = dir.path().join("token.txt");
        std::fs::write(&key, "plain-token\n").unwrap();
        let book = HttpWorkbook::new("https://sheets.example.com", "id", &key).unwrap();
        assert_eq!(book.token, "plain-token");
    }

    #[tokio::test]
    async fn test_range_is_padded() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", Matcher::Regex(r"^/v4/spreadsheets/sheet0123456789/values/.*B3:D4".into()))
            .match_header("authorization", "Bearer secret")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{ "range": "x", "values": [["1", "", "2"]] }"#)
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let book = workbook(&dir, &server.url());
        let cells = book
            .range("Mondstadt Data", CellRange::new(3, 2, 4, 4))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(cells.len(), 2);
        assert_eq!(cells[0], vec!["1", "", "2"]);
        assert_eq!(cells[1], vec!["", "", ""]);
    }

    #[tokio::test]
    async fn test_unknown_sheet() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", Matcher::Any)
            .with_status(400)
            .with_body(r#"{ "error": { "message": "Unable to parse range: 'Nowhere Data'!1:1" } }"#)
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let book = workbook(&dir, &server.url());
        let result = book.row_values("Nowhere Data", 1).await;
        assert!(matches!(result, Err(RemoteError::SheetNotFound(_))));
    }

    #[tokio::test]
    async fn test_update_cell_sends_raw_value() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PUT", Matcher::Regex(r"C9".into()))
            .match_query(Matcher::UrlEncoded("valueInputOption".into(), "RAW".into()))
            .match_body(Matcher::PartialJsonString(r#"{ "values": [["2"]] }"#.into()))
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let book = workbook(&dir, &server.url());
        book.update_cell("DataEntry", 9, 3, "2").await.unwrap();
        mock.assert_async().await;
    }
}
