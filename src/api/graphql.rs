use crate::error::AppError;
use crate::models::AuthToken;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, error};
use url::Url;

const LOG_BODY_LIMIT: usize = 1200;

/// Error codes Kraken uses for rejected or expired credentials.
const AUTH_ERROR_CODES: [&str; 5] = [
    "KT-CT-1111",
    "KT-CT-1112",
    "KT-CT-1124",
    "KT-CT-1138",
    "KT-CT-1139",
];

/// One fixed GraphQL document sent to the Kraken endpoint.
#[derive(Debug, Clone, Copy)]
pub struct Document {
    pub tag: &'static str,
    pub query: &'static str,
    /// Any GraphQL error on this document means the credentials were refused.
    pub rejects_credentials: bool,
}

pub const OBTAIN_TOKEN: Document = Document {
    tag: "login",
    query: r#"
mutation obtainKrakenToken($input: ObtainJSONWebTokenInput!) {
  obtainKrakenToken(input: $input) {
    token
    refreshToken
    refreshExpiresIn
  }
}
"#,
    rejects_credentials: true,
};

pub const ACCOUNTS: Document = Document {
    tag: "accounts",
    query: r#"
query accountViewer {
  viewer {
    accounts {
      number
    }
  }
}
"#,
    rejects_credentials: false,
};

pub const HALF_HOURLY_READINGS: Document = Document {
    tag: "hh",
    query: r#"
query halfHourlyReadings($accountNumber: String!, $fromDatetime: DateTime, $toDatetime: DateTime) {
  account(accountNumber: $accountNumber) {
    properties {
      electricitySupplyPoints {
        halfHourlyReadings(fromDatetime: $fromDatetime, toDatetime: $toDatetime) {
          startAt
          endAt
          version
          value
        }
      }
    }
  }
}
"#,
    rejects_credentials: false,
};

#[derive(Debug, Clone)]
pub struct GraphqlClient {
    http: Client,
    endpoint: Url,
}

impl GraphqlClient {
    pub fn new(endpoint: &str) -> Result<Self, AppError> {
        let http = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            endpoint: Url::parse(endpoint)?,
        })
    }

    /// Posts `doc` and returns the `data` object of the response.
    pub async fn post(
        &self,
        doc: &Document,
        variables: Value,
        token: Option<&AuthToken>,
    ) -> Result<Value, AppError> {
        let tag = doc.tag;
        let mut req = self
            .http
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json")
            .json(&json!({ "query": doc.query, "variables": variables }));
        if let Some(token) = token {
            req = req.header(AUTHORIZATION, token.header_value());
        }

        debug!(tag, url = %self.endpoint, "graphql request");

        let response = req
            .send()
            .await
            .map_err(|e| AppError::Fetch(format!("{tag}: {e}")))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| AppError::Fetch(format!("{tag}: {e}")))?;

        classify_response(doc, status, &text)
    }
}

fn classify_response(doc: &Document, status: StatusCode, text: &str) -> Result<Value, AppError> {
    let tag = doc.tag;

    let body: Value = match serde_json::from_str(text) {
        Ok(body) => body,
        Err(_) => {
            error!(tag, http = status.as_u16(), body = truncate(text), "invalid json");
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Err(AppError::Auth(format!("HTTP {}", status.as_u16())));
            }
            return Err(AppError::Fetch(format!(
                "{tag}: invalid JSON (HTTP {})",
                status.as_u16()
            )));
        }
    };

    let errors = body.get("errors").filter(|e| has_errors(e));

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        error!(tag, http = status.as_u16(), "unauthorized");
        return Err(AppError::Auth(format!("HTTP {}", status.as_u16())));
    }

    if status.is_client_error() || status.is_server_error() {
        if let Some(errors) = errors {
            error!(tag, http = status.as_u16(), graphql_errors = %errors, "http error");
            return Err(AppError::Fetch(format!(
                "{tag}: HTTP {} GraphQL errors: {errors}",
                status.as_u16()
            )));
        }
        error!(tag, http = status.as_u16(), body = truncate(text), "http error");
        return Err(AppError::Fetch(format!("{tag}: HTTP {}", status.as_u16())));
    }

    if let Some(errors) = errors {
        let msg = errors.to_string();
        error!(tag, graphql_errors = %msg, "graphql errors");
        if doc.rejects_credentials || is_auth_message(&msg) {
            return Err(AppError::Auth(msg));
        }
        return Err(AppError::Fetch(format!("{tag}: {msg}")));
    }

    match body.get("data") {
        Some(data) if data.is_object() => Ok(data.clone()),
        _ => {
            error!(tag, body = truncate(text), "missing data");
            Err(AppError::Fetch(format!("{tag}: missing data")))
        }
    }
}

fn has_errors(errors: &Value) -> bool {
    match errors {
        Value::Null => false,
        Value::Array(items) => !items.is_empty(),
        _ => true,
    }
}

fn is_auth_message(msg: &str) -> bool {
    msg.contains("Unauthorized")
        || msg.contains("UNAUTHENTICATED")
        || AUTH_ERROR_CODES.iter().any(|code| msg.contains(code))
}

fn truncate(text: &str) -> &str {
    match text.char_indices().nth(LOG_BODY_LIMIT) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
