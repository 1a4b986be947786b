use crate::error::ModelError;
use crate::inference::ModelService;
use crate::records::{ScoredPoint, SeriesPoint};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

const TOKEN_HEADER: &str = "X-Model-Service-Token";
const ERROR_BODY_LIMIT: usize = 512;

/// Model registry and scoring over HTTP.
///
/// `GET {base}/models` lists the variables with a trained model and
/// `POST {base}/models/{variable}/score` scores one series.
#[derive(Clone)]
pub struct HttpModelService {
    client: Client,
    base_url: Url,
    token: Option<String>,
}

#[derive(Deserialize)]
struct ModelListResponse {
    variables: Vec<String>,
}

#[derive(Serialize)]
struct ScoreRequest<'a> {
    variable: &'a str,
    points: Vec<ScoreRequestPoint>,
}

#[derive(Serialize)]
struct ScoreRequestPoint {
    ds: DateTime<Utc>,
    y: f64,
}

#[derive(Deserialize)]
struct ScoreResponse {
    points: Vec<ScoreResponsePoint>,
}

#[derive(Debug, Deserialize)]
struct ScoreResponsePoint {
    ds: DateTime<Utc>,
    #[serde(default)]
    y: Option<f64>,
    #[serde(default)]
    yhat: Option<f64>,
    #[serde(default)]
    yhat_lower: Option<f64>,
    #[serde(default)]
    yhat_upper: Option<f64>,
    #[serde(default)]
    residual: Option<f64>,
    #[serde(default)]
    outside_interval: bool,
    #[serde(default)]
    high_residual: bool,
    #[serde(default)]
    is_anomaly: bool,
    #[serde(default)]
    anomaly_score: Option<f64>,
    #[serde(default)]
    prediction_error_pct: Option<f64>,
    #[serde(default)]
    source_file: Option<String>,
}

impl From<ScoreResponsePoint> for ScoredPoint {
    fn from(point: ScoreResponsePoint) -> Self {
        Self {
            timestamp: point.ds,
            observed: point.y,
            predicted: point.yhat,
            lower: point.yhat_lower,
            upper: point.yhat_upper,
            residual: point.residual,
            outside_interval: point.outside_interval,
            high_residual: point.high_residual,
            is_anomaly: point.is_anomaly,
            anomaly_score: point.anomaly_score,
            prediction_error_pct: point.prediction_error_pct,
            source: point.source_file,
        }
    }
}

impl HttpModelService {
    pub fn new(
        base_url: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ModelError> {
        let base_url = Url::parse(base_url.trim())
            .map_err(|err| ModelError::InvalidUrl(format!("{base_url}: {err}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ModelError::InvalidUrl(base_url.to_string()));
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url,
            token,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ModelError> {
        let mut url = self.base_url.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| ModelError::InvalidUrl(self.base_url.to_string()))?;
            path.pop_if_empty();
            for segment in segments {
                path.push(segment);
            }
        }
        Ok(url)
    }

    fn models_url(&self) -> Result<Url, ModelError> {
        self.endpoint(&["models"])
    }

    fn score_url(&self, variable: &str) -> Result<Url, ModelError> {
        self.endpoint(&["models", variable, "score"])
    }

    fn with_token(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.token.as_deref() {
            Some(token) => request.header(TOKEN_HEADER, token),
            None => request,
        }
    }
}

#[async_trait]
impl ModelService for HttpModelService {
    async fn available_variables(&self) -> Result<BTreeSet<String>, ModelError> {
        let response = self
            .with_token(self.client.get(self.models_url()?))
            .send()
            .await?;
        let response = ensure_success(response).await?;
        let body: ModelListResponse = response.json().await?;
        Ok(body
            .variables
            .into_iter()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect())
    }

    async fn score(
        &self,
        variable: &str,
        points: &[SeriesPoint],
    ) -> Result<Vec<ScoredPoint>, ModelError> {
        let payload = ScoreRequest {
            variable,
            points: points
                .iter()
                .map(|p| ScoreRequestPoint {
                    ds: p.timestamp,
                    y: p.value,
                })
                .collect(),
        };
        let response = self
            .with_token(self.client.post(self.score_url(variable)?).json(&payload))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(ModelError::UnknownVariable(variable.to_string()));
        }
        let response = ensure_success(response).await?;
        let body: ScoreResponse = response.json().await?;
        Ok(body.points.into_iter().map(ScoredPoint::from).collect())
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ModelError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > ERROR_BODY_LIMIT {
        let mut cut = ERROR_BODY_LIMIT;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    Err(ModelError::Status {
        status: status.as_u16(),
        body,
    })
}
