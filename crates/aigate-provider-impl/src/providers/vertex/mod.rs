//! Google Vertex AI director: OpenAI-compatible chat passthrough plus
//! OpenAI image generation/edit mapped onto Gemini `generateContent`.

mod oauth;

use std::sync::Arc;

use aigate_protocol::gemini::GenerateContentResponse;
use aigate_protocol::openai::{ImageGenerationRequest, InputImage};
use aigate_provider_core::api_style::STYLE_VERTEX;
use aigate_provider_core::{
    Filter, OutboundRequest, ProviderError, ProviderResult, RequestCtx, RequestFilter,
    RequestSignal, ResponseFilter, ResponseHead, SseChunkSplitter, header_get, header_remove,
    header_set,
};
use aigate_transform::image::{gemini_to_images, image_request_to_gemini};
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;

pub use oauth::{DEFAULT_SCOPE, DEFAULT_TOKEN_URI, ServiceAccountKey, VertexToken, VertexTokenCache};

use crate::filters::apply_api_config;
use crate::form::{FormPart, is_multipart, parse_multipart};
use crate::providers::anthropic::convert_error;

pub const VERTEX_DIRECTOR: &str = "vertex-director";

const DEFAULT_LOCATION: &str = "global";
const IMAGES_GENERATIONS: &str = "/v1/images/generations";
const IMAGES_EDITS: &str = "/v1/images/edits";

fn vertex_host(location: &str) -> String {
    if location == DEFAULT_LOCATION {
        "aiplatform.googleapis.com".to_string()
    } else {
        format!("{location}-aiplatform.googleapis.com")
    }
}

/// `gemini-2.5-pro` and `models/gemini-2.5-pro` become `google/gemini-2.5-pro`;
/// names that already carry a publisher are kept.
fn openai_model_name(model: &str) -> String {
    let model = model.trim();
    if let Some(rest) = model.strip_prefix("publishers/")
        && let Some((publisher, name)) = rest.split_once("/models/")
    {
        return format!("{publisher}/{name}");
    }
    if let Some(rest) = model.strip_prefix("models/") {
        return format!("google/{rest}");
    }
    if model.contains('/') {
        return model.to_string();
    }
    format!("google/{model}")
}

fn gemini_model_name(model: &str) -> &str {
    let model = model.trim();
    let model = model.strip_prefix("models/").unwrap_or(model);
    model.strip_prefix("publishers/google/models/").unwrap_or(model)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Chat,
    Images,
}

pub struct VertexDirector {
    tokens: Arc<VertexTokenCache>,
    mode: Option<Mode>,
    active: bool,
}

impl VertexDirector {
    pub fn new(tokens: Arc<VertexTokenCache>) -> Self {
        Self {
            tokens,
            mode: None,
            active: false,
        }
    }

    fn enabled(ctx: &RequestCtx) -> bool {
        ctx.style_is(STYLE_VERTEX)
    }
}

fn image_generation_request(req: &OutboundRequest) -> ProviderResult<(ImageGenerationRequest, Vec<InputImage>)> {
    let generation: ImageGenerationRequest = serde_json::from_slice(&req.body)
        .map_err(|err| ProviderError::InvalidRequest(format!("image generation request: {err}")))?;
    Ok((generation, Vec::new()))
}

fn image_edit_request(req: &OutboundRequest) -> ProviderResult<(ImageGenerationRequest, Vec<InputImage>)> {
    let content_type = req
        .content_type()
        .filter(|ct| is_multipart(Some(ct)))
        .ok_or_else(|| {
            ProviderError::InvalidRequest("image edits require multipart/form-data".to_string())
        })?;
    let parts = parse_multipart(content_type, &req.body)?;

    let text = |name: &str| {
        parts
            .iter()
            .find(|part| part.name == name && !part.is_file())
            .and_then(FormPart::text)
            .map(str::to_string)
    };
    let generation = ImageGenerationRequest {
        model: text("model").unwrap_or_default(),
        prompt: text("prompt").unwrap_or_default(),
        n: text("n").and_then(|n| n.trim().parse().ok()),
        size: text("size"),
        quality: text("quality"),
        response_format: text("response_format"),
        user: text("user"),
    };
    let images = parts
        .iter()
        .filter(|part| part.is_file() && matches!(part.name.as_str(), "image" | "image[]"))
        .map(|part| InputImage {
            mime_type: part
                .content_type
                .clone()
                .filter(|ct| ct.starts_with("image/"))
                .unwrap_or_else(|| "image/png".to_string()),
            data: part.data.to_vec(),
        })
        .collect();
    Ok((generation, images))
}

impl Filter for VertexDirector {
    fn name(&self) -> &str {
        VERTEX_DIRECTOR
    }

    fn as_request_filter(&mut self) -> Option<&mut dyn RequestFilter> {
        Some(self)
    }

    fn as_response_filter(&mut self) -> Option<&mut dyn ResponseFilter> {
        Some(self)
    }
}

#[async_trait]
impl RequestFilter for VertexDirector {
    async fn on_request(
        &mut self,
        ctx: &mut RequestCtx,
        req: &mut OutboundRequest,
    ) -> ProviderResult<RequestSignal> {
        if !Self::enabled(ctx) {
            return Ok(RequestSignal::Continue);
        }
        let provider = ctx.provider()?;
        let location = provider
            .metadata_str("location")
            .unwrap_or(DEFAULT_LOCATION)
            .to_string();
        let credential = provider.api_key.clone();
        let model_name = ctx.model()?.name.clone();

        let token = self.tokens.token(&credential).await?;
        ctx.set_template_var("vertex", "access_token", token.access_token.clone());
        ctx.set_template_var("vertex", "project_id", token.project_id.clone());
        ctx.set_template_var("vertex", "location", location.clone());

        let project = &token.project_id;
        req.scheme = "https".to_string();
        req.host = vertex_host(&location);

        let image_request = match req.path.as_str() {
            IMAGES_GENERATIONS => Some(image_generation_request(req)?),
            IMAGES_EDITS => Some(image_edit_request(req)?),
            _ => None,
        };
        match image_request {
            Some((generation, images)) => {
                let body = image_request_to_gemini(&generation, &images).map_err(convert_error)?;
                req.method = "POST".to_string();
                req.path = format!(
                    "/v1/projects/{project}/locations/{location}/publishers/google/models/{}:generateContent",
                    gemini_model_name(&model_name)
                );
                req.query.clear();
                req.set_json_body(&body)?;
                self.mode = Some(Mode::Images);
            }
            None => {
                let suffix = req.path.strip_prefix("/v1").unwrap_or(&req.path).to_string();
                req.path = format!(
                    "/v1beta1/projects/{project}/locations/{location}/endpoints/openapi{suffix}"
                );
                if let Ok(mut body) = serde_json::from_slice::<Value>(&req.body)
                    && let Some(object) = body.as_object_mut()
                    && object.contains_key("model")
                {
                    object.insert("model".to_string(), Value::String(openai_model_name(&model_name)));
                    req.set_json_body(&body)?;
                }
                if ctx.is_stream {
                    ctx.chunk_splitter = Some(Box::new(SseChunkSplitter::default()));
                }
                self.mode = Some(Mode::Chat);
            }
        }

        apply_api_config(ctx, req)?;
        if header_get(&req.headers, "authorization").is_none() {
            header_set(
                &mut req.headers,
                "authorization",
                format!("Bearer {}", token.access_token),
            );
        }
        Ok(RequestSignal::Continue)
    }
}

#[async_trait]
impl ResponseFilter for VertexDirector {
    async fn on_headers(&mut self, ctx: &mut RequestCtx, head: &mut ResponseHead) -> ProviderResult<()> {
        self.active = Self::enabled(ctx) && head.is_success() && self.mode == Some(Mode::Images);
        if self.active {
            header_remove(&mut head.headers, "content-length");
            header_remove(&mut head.headers, "content-encoding");
            header_set(&mut head.headers, "content-type", "application/json");
        }
        Ok(())
    }

    async fn on_body_chunk(
        &mut self,
        ctx: &mut RequestCtx,
        _head: &ResponseHead,
        chunk: Bytes,
        _index: usize,
    ) -> ProviderResult<Option<Bytes>> {
        if !self.active {
            return Ok(Some(chunk));
        }
        let response: GenerateContentResponse = serde_json::from_slice(&chunk)
            .map_err(|err| ProviderError::Upstream(format!("vertex generateContent response: {err}")))?;
        let images = gemini_to_images(response, ctx.created);
        let body = serde_json::to_vec(&images)
            .map_err(|err| ProviderError::Upstream(format!("encode images response: {err}")))?;
        Ok(Some(Bytes::from(body)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::form::tests::multipart_body;
    use crate::http_client::{AuxiliaryClient, FetchedAsset, AuxiliaryResponse};
    use crate::test_support::{ctx_for, model, provider};
    use serde_json::json;
    use time::OffsetDateTime;

    const CREDENTIAL: &str = r#"{"client_email":"svc@proj.iam.gserviceaccount.com","private_key":"pem","project_id":"proj-1"}"#;

    struct NoNetwork;

    #[async_trait]
    impl AuxiliaryClient for NoNetwork {
        async fn fetch(&self, _url: &str) -> ProviderResult<FetchedAsset> {
            unreachable!()
        }

        async fn post_form(&self, _url: &str, _form: &[(&str, &str)]) -> ProviderResult<AuxiliaryResponse> {
            unreachable!("token is seeded")
        }

        async fn get(&self, _url: &str, _headers: &[(String, String)]) -> ProviderResult<AuxiliaryResponse> {
            unreachable!("vertex does not poll")
        }
    }

    async fn director() -> VertexDirector {
        let cache = VertexTokenCache::new(Arc::new(NoNetwork));
        let expires_at = OffsetDateTime::now_utc().unix_timestamp() + 3600;
        cache
            .seed(
                CREDENTIAL,
                VertexToken {
                    access_token: "ya29.token".into(),
                    project_id: "proj-1".into(),
                },
                expires_at,
            )
            .await;
        VertexDirector::new(Arc::new(cache))
    }

    fn vertex_ctx(method: &str, path: &str, location: Option<&str>, api: Value) -> RequestCtx {
        let metadata = match location {
            Some(location) => json!({"location": location}),
            None => Value::Null,
        };
        let mut provider = provider(metadata, api);
        provider.api_key = CREDENTIAL.into();
        ctx_for(method, path, provider, model("gemini-2.5-flash-image", Value::Null))
    }

    fn vertex_api() -> Value {
        json!({"api_style": "google-vertex-ai", "directives": {"*:*": {}}})
    }

    #[tokio::test]
    async fn maps_image_generation_to_generate_content() {
        let mut ctx = vertex_ctx("POST", IMAGES_GENERATIONS, Some("us-central1"), vertex_api());
        let mut req = OutboundRequest {
            method: "POST".into(),
            path: IMAGES_GENERATIONS.into(),
            body: Bytes::from(
                json!({"model": "gemini-2.5-flash-image", "prompt": "a red fox", "size": "1792x1024", "n": 2}).to_string(),
            ),
            ..Default::default()
        };
        let mut director = director().await;
        director.on_request(&mut ctx, &mut req).await.unwrap();

        assert_eq!(req.host, "us-central1-aiplatform.googleapis.com");
        assert_eq!(
            req.path,
            "/v1/projects/proj-1/locations/us-central1/publishers/google/models/gemini-2.5-flash-image:generateContent"
        );
        assert_eq!(header_get(&req.headers, "authorization"), Some("Bearer ya29.token"));
        let body: Value = serde_json::from_slice(&req.body).unwrap();
        assert_eq!(body["contents"][0]["parts"][0]["text"], "a red fox");
        assert_eq!(body["generationConfig"]["candidateCount"], 2);
        assert_eq!(body["generationConfig"]["imageConfig"]["aspectRatio"], "16:9");
        assert_eq!(body["generationConfig"]["imageConfig"]["imageSize"], "2K");
        assert_eq!(ctx.object_graph()["vertex"]["project_id"], "proj-1");
    }

    #[tokio::test]
    async fn maps_multipart_image_edit() {
        let mut ctx = vertex_ctx("POST", IMAGES_EDITS, None, vertex_api());
        let (content_type, body) = multipart_body(&[
            ("prompt", None, b"add a hat"),
            ("image[]", Some("cat.png"), b"\x89PNG"),
        ]);
        let mut req = OutboundRequest {
            method: "POST".into(),
            path: IMAGES_EDITS.into(),
            headers: vec![("content-type".into(), content_type)],
            body,
            ..Default::default()
        };
        let mut director = director().await;
        director.on_request(&mut ctx, &mut req).await.unwrap();

        assert_eq!(req.host, "aiplatform.googleapis.com");
        let body: Value = serde_json::from_slice(&req.body).unwrap();
        let parts = body["contents"][0]["parts"].as_array().unwrap();
        assert_eq!(parts.len(), 2);
        assert!(parts[0]["inlineData"]["data"].is_string());
        assert_eq!(parts[1]["text"], "add a hat");
        assert_eq!(body["generationConfig"]["imageConfig"]["imageSize"], "1K");
    }

    #[tokio::test]
    async fn empty_prompt_is_rejected() {
        let mut ctx = vertex_ctx("POST", IMAGES_GENERATIONS, None, vertex_api());
        let mut req = OutboundRequest {
            path: IMAGES_GENERATIONS.into(),
            body: Bytes::from(json!({"prompt": "  "}).to_string()),
            ..Default::default()
        };
        let err = director().await.on_request(&mut ctx, &mut req).await.unwrap_err();
        assert!(matches!(err, ProviderError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn chat_goes_to_openai_endpoint_with_templated_headers() {
        let api = json!({
            "api_style": "google-vertex-ai",
            "directives": {"POST:/v1/chat/completions": {
                "headers": {
                    "authorization": {"op": "set", "values": ["Bearer ${@vertex.access_token}"]},
                    "x-goog-user-project": {"op": "set", "values": ["${@vertex.project_id}"]}
                }
            }}
        });
        let mut ctx = vertex_ctx("POST", "/v1/chat/completions", None, api);
        ctx.is_stream = true;
        let mut req = OutboundRequest {
            method: "POST".into(),
            path: "/v1/chat/completions".into(),
            body: Bytes::from(json!({"model": "gemini-2.5-flash-image", "stream": true, "messages": []}).to_string()),
            ..Default::default()
        };
        let mut director = director().await;
        director.on_request(&mut ctx, &mut req).await.unwrap();

        assert_eq!(
            req.path,
            "/v1beta1/projects/proj-1/locations/global/endpoints/openapi/chat/completions"
        );
        assert_eq!(header_get(&req.headers, "authorization"), Some("Bearer ya29.token"));
        assert_eq!(header_get(&req.headers, "x-goog-user-project"), Some("proj-1"));
        let body: Value = serde_json::from_slice(&req.body).unwrap();
        assert_eq!(body["model"], "google/gemini-2.5-flash-image");
        assert!(ctx.chunk_splitter.is_some());

        let mut head = ResponseHead { status: 200, headers: Vec::new() };
        director.on_headers(&mut ctx, &mut head).await.unwrap();
        let chunk = Bytes::from_static(b"data: {}\n\n");
        let out = director.on_body_chunk(&mut ctx, &head, chunk.clone(), 0).await.unwrap();
        assert_eq!(out, Some(chunk));
    }

    #[tokio::test]
    async fn converts_generate_content_response() {
        let mut ctx = vertex_ctx("POST", IMAGES_GENERATIONS, None, vertex_api());
        let mut director = director().await;
        director.mode = Some(Mode::Images);
        let mut head = ResponseHead {
            status: 200,
            headers: vec![("content-length".into(), "99".into())],
        };
        director.on_headers(&mut ctx, &mut head).await.unwrap();
        assert_eq!(header_get(&head.headers, "content-length"), None);

        let upstream = json!({"candidates": [{"content": {"role": "model", "parts": [
            {"text": "A fox."},
            {"inlineData": {"mimeType": "image/png", "data": "iVBOR"}}
        ]}}]});
        let out = director
            .on_body_chunk(&mut ctx, &head, Bytes::from(upstream.to_string()), 0)
            .await
            .unwrap()
            .unwrap();
        let body: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(body["created"], 1_700_000_100);
        assert_eq!(body["data"][0]["b64_json"], "iVBOR");
        assert_eq!(body["data"][0]["revised_prompt"], "A fox.");
    }

    #[test]
    fn model_names_are_normalized_for_each_endpoint() {
        assert_eq!(openai_model_name("gemini-2.5-pro"), "google/gemini-2.5-pro");
        assert_eq!(openai_model_name("models/gemini-2.5-pro"), "google/gemini-2.5-pro");
        assert_eq!(openai_model_name("publishers/meta/models/llama"), "meta/llama");
        assert_eq!(gemini_model_name("publishers/google/models/imagen"), "imagen");
    }
}
