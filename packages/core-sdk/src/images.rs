use axum::{
    body::Body,
    http::header::{CACHE_CONTROL, CONTENT_TYPE},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{error_message, RelayError},
    llm,
    providers::{ProviderId, ProviderRegistry},
};

/** \brief 图像生成使用的上游模型。 */
pub const IMAGE_MODEL: &str = "grok-2-image";
/** \brief 单次请求允许生成的最大张数。 */
pub const MAX_IMAGES: u32 = 10;
const PROXY_CACHE_CONTROL: &str = "public, max-age=31536000, immutable";
const PROXY_DEFAULT_CONTENT_TYPE: &str = "image/jpeg";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageFormat {
    #[default]
    Url,
    B64Json,
}

/**
 * \brief `POST /api/images` 请求体。
 */
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageRequest {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub n: Option<u32>,
    #[serde(default)]
    pub response_format: Option<ImageFormat>,
    #[serde(default, rename = "apiKey")]
    pub api_key: Option<String>,
}

/**
 * \brief 发往上游 `images/generations` 的请求体。
 */
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImagePayload {
    pub model: String,
    pub prompt: String,
    pub n: u32,
    pub response_format: ImageFormat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedImage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub b64_json: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revised_prompt: Option<String>,
}

impl ImageRequest {
    /**
     * \brief 校验并补全默认值（n=1，response_format=url）；失败时不触达上游。
     */
    pub fn into_payload(self) -> Result<(String, ImagePayload), RelayError> {
        let api_key = self
            .api_key
            .filter(|k| !k.trim().is_empty())
            .ok_or(RelayError::MissingCredential)?;
        let prompt = self
            .prompt
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| RelayError::InvalidInput("a non-empty prompt is required".to_string()))?;
        let n = self.n.unwrap_or(1);
        if !(1..=MAX_IMAGES).contains(&n) {
            return Err(RelayError::InvalidInput(format!(
                "n must be between 1 and {}",
                MAX_IMAGES
            )));
        }
        Ok((
            api_key,
            ImagePayload {
                model: IMAGE_MODEL.to_string(),
                prompt,
                n,
                response_format: self.response_format.unwrap_or_default(),
            },
        ))
    }
}

/**
 * \brief 调用 xAI 图像生成接口，原样返回上游结果 `{ data: [...] }`。
 */
pub async fn generate(
    registry: &ProviderRegistry,
    request: ImageRequest,
) -> Result<Value, RelayError> {
    let (api_key, payload) = request.into_payload()?;
    let client = llm::create_client(registry, ProviderId::Xai.as_str(), &api_key)?;
    let url = client.provider().endpoint("images/generations");
    let resp = client.post_json(&url, &payload).await?;
    resp.json().await.map_err(RelayError::transport)
}

/**
 * \brief 校验图片代理的 `url` 参数：必须存在且以 http 开头。
 */
pub fn validate_proxy_url(url: Option<&str>) -> Result<&str, RelayError> {
    let url = url
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .ok_or_else(|| RelayError::InvalidInput("image URL not provided".to_string()))?;
    if !url.starts_with("http") {
        return Err(RelayError::InvalidInput("invalid image URL".to_string()));
    }
    Ok(url)
}

/**
 * \brief 抓取远端图片并以流的形式转发，附带上游 Content-Type 与长期缓存头。
 */
pub async fn proxy(url: Option<&str>) -> Result<Response, RelayError> {
    let url = validate_proxy_url(url)?;
    let resp = reqwest::get(url).await.map_err(RelayError::transport)?;
    if !resp.status().is_success() {
        return Err(RelayError::Upstream {
            status: Some(resp.status().as_u16()),
            message: "could not download image".to_string(),
        });
    }
    let content_type = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(PROXY_DEFAULT_CONTENT_TYPE)
        .to_string();
    Ok((
        [
            (CONTENT_TYPE, content_type),
            (CACHE_CONTROL, PROXY_CACHE_CONTROL.to_string()),
        ],
        Body::from_stream(resp.bytes_stream()),
    )
        .into_response())
}

/**
 * \brief 客户端：通过中继请求生成图片。
 */
pub async fn request_images(
    http: &reqwest::Client,
    relay_url: &str,
    api_key: &str,
    prompt: &str,
    n: u32,
    format: ImageFormat,
) -> Result<Vec<GeneratedImage>, RelayError> {
    let url = format!("{}/api/images", relay_url.trim_end_matches('/'));
    let resp = http
        .post(url)
        .json(&serde_json::json!({
            "prompt": prompt,
            "n": n,
            "response_format": format,
            "apiKey": api_key,
        }))
        .send()
        .await
        .map_err(RelayError::transport)?;
    let status = resp.status();
    let text = resp.text().await.map_err(RelayError::transport)?;
    if !status.is_success() {
        return Err(RelayError::upstream(status.as_u16(), &text));
    }
    let v: Value = serde_json::from_str(&text).map_err(|e| RelayError::Upstream {
        status: None,
        message: format!("invalid image response: {}", e),
    })?;
    if let Some(message) = error_message(&v).filter(|_| v.get("data").is_none()) {
        return Err(RelayError::Upstream {
            status: None,
            message,
        });
    }
    let data = v.get("data").cloned().unwrap_or(Value::Array(Vec::new()));
    serde_json::from_value(data).map_err(|e| RelayError::Upstream {
        status: None,
        message: format!("invalid image list: {}", e),
    })
}
