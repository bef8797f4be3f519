use crate::providers::types::{
    ProviderError, ProviderKind, ProviderRequest, ProviderResponse, ProviderUsage,
};
use crate::transport::ExecutionTransport;
use reqwest::blocking::Client;
use serde_json::{json, Value};
use std::time::Duration;
use url::Url;

const REQUEST_TIMEOUT_SECS: u64 = 60;
const CORRELATION_HEADER: &str = "X-Client-Request-Id";

/// Chat-completions transport for OpenAI and API-compatible servers.
pub struct OpenAiHttpTransport {
    endpoint: String,
}

impl OpenAiHttpTransport {
    pub fn new(base_url: &Url) -> Self {
        let base = base_url.as_str().trim_end_matches('/');
        Self {
            endpoint: format!("{base}/chat/completions"),
        }
    }

    fn require_key(api_key: Option<&str>) -> Result<&str, ProviderError> {
        api_key.filter(|v| !v.trim().is_empty()).ok_or_else(|| {
            ProviderError::non_retryable("Provider key is not set. Add an API key and try again.")
        })
    }

    fn classify_http_status(http_status: u16) -> ProviderError {
        match http_status {
            401 | 403 => ProviderError::non_retryable(
                "Provider rejected the request. Check your API key and try again.",
            ),
            408 | 429 => ProviderError::retryable(
                "Provider is rate limiting or temporarily unavailable. Try again shortly.",
            ),
            500..=599 => {
                ProviderError::retryable("Provider is temporarily unavailable. Try again shortly.")
            }
            _ => ProviderError::non_retryable(
                "Provider rejected the request. Update the input and try again.",
            ),
        }
    }

    fn build_body(request: &ProviderRequest) -> Value {
        let mut messages = Vec::new();
        if let Some(instructions) = request.instructions.as_deref() {
            messages.push(json!({ "role": "system", "content": instructions }));
        }

        let user_content = match request.image_data_url.as_deref() {
            Some(image_url) => json!([
                { "type": "text", "text": request.input },
                { "type": "image_url", "image_url": { "url": image_url } }
            ]),
            None => Value::String(request.input.clone()),
        };
        messages.push(json!({ "role": "user", "content": user_content }));

        let mut body = json!({
            "model": request.model,
            "messages": messages,
        });
        if let Some(max_tokens) = request.max_output_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(schema) = request.response_schema.as_ref() {
            body["response_format"] = json!({
                "type": "json_schema",
                "json_schema": { "name": "workflow_spec", "strict": true, "schema": schema }
            });
        }
        body
    }

    fn parse_response(request: &ProviderRequest, json: &Value) -> Result<ProviderResponse, ProviderError> {
        let text = json
            .get("choices")
            .and_then(|v| v.get(0))
            .and_then(|v| v.get("message"))
            .and_then(|v| v.get("content"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| ProviderError::non_retryable("Provider response had no content."))?
            .to_string();

        let usage = json.get("usage");
        let read_u64 = |field: &str| usage.and_then(|u| u.get(field)).and_then(|v| v.as_u64());
        let input_tokens = read_u64("prompt_tokens").unwrap_or(0) as u32;
        let output_tokens = read_u64("completion_tokens").unwrap_or(0) as u32;

        Ok(ProviderResponse {
            provider_kind: ProviderKind::OpenAi,
            model: request.model.clone(),
            text,
            usage: ProviderUsage {
                input_tokens,
                output_tokens,
                total_tokens: read_u64("total_tokens"),
            },
        })
    }
}

impl ExecutionTransport for OpenAiHttpTransport {
    fn dispatch(
        &self,
        request: &ProviderRequest,
        api_key: Option<&str>,
    ) -> Result<ProviderResponse, ProviderError> {
        let key = Self::require_key(api_key)?;
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|_| ProviderError::retryable("Could not initialize secure network client."))?;

        let mut builder = client.post(&self.endpoint).bearer_auth(key);
        if let Some(correlation_id) = request.correlation_id.as_deref() {
            builder = builder.header(CORRELATION_HEADER, correlation_id);
        }
        let response = builder
            .json(&Self::build_body(request))
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::retryable("Provider request timed out. Try again shortly.")
                } else {
                    ProviderError::retryable("Could not reach the provider. Try again shortly.")
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::classify_http_status(status.as_u16()));
        }

        let json = response
            .json::<Value>()
            .map_err(|_| ProviderError::retryable("Provider response could not be parsed."))?;
        Self::parse_response(request, &json)
    }

    fn requires_api_key(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::OpenAiHttpTransport;
    use crate::providers::types::{ProviderKind, ProviderRequest};
    use crate::transport::ExecutionTransport;
    use serde_json::{json, Value};
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::mpsc;
    use std::thread;
    use url::Url;

    fn read_request(stream: &mut TcpStream) -> String {
        let mut raw = Vec::new();
        let mut buf = [0_u8; 4096];
        loop {
            let n = stream.read(&mut buf).expect("read request");
            if n == 0 {
                break;
            }
            raw.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&raw).to_string();
            if let Some(header_end) = text.find("\r\n\r\n") {
                let content_length = text[..header_end]
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if raw.len() >= header_end + 4 + content_length {
                    return text;
                }
            }
        }
        String::from_utf8_lossy(&raw).to_string()
    }

    fn spawn_server(status_line: &str, body: String) -> (Url, mpsc::Receiver<String>, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind test server");
        let addr = listener.local_addr().expect("local addr");
        let url = Url::parse(&format!("http://{addr}/v1")).expect("server url");
        let status_line = status_line.to_string();
        let (tx, rx) = mpsc::channel();

        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let request = read_request(&mut stream);
            tx.send(request).expect("send captured request");
            let response = format!(
                "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).expect("write response");
        });

        (url, rx, handle)
    }

    fn request(schema: Option<Value>, image: Option<&str>) -> ProviderRequest {
        ProviderRequest {
            provider_kind: ProviderKind::OpenAi,
            model: "gpt-4o-mini".to_string(),
            instructions: Some("Be brief.".to_string()),
            input: "Summarize this".to_string(),
            image_data_url: image.map(|s| s.to_string()),
            response_schema: schema,
            max_output_tokens: Some(64),
            correlation_id: None,
        }
    }

    #[test]
    fn parses_completion_text_and_usage() {
        let body = json!({
            "choices": [{ "message": { "role": "assistant", "content": "done" } }],
            "usage": { "prompt_tokens": 7, "completion_tokens": 2, "total_tokens": 9 }
        })
        .to_string();
        let (url, captured, handle) = spawn_server("200 OK", body);

        let transport = OpenAiHttpTransport::new(&url);
        let response = transport
            .dispatch(&request(None, None), Some("sk-test"))
            .expect("completion");
        handle.join().expect("server thread");

        assert_eq!(response.text, "done");
        assert_eq!(response.usage.input_tokens, 7);
        assert_eq!(response.usage.output_tokens, 2);
        assert_eq!(response.usage.total_tokens, Some(9));

        let raw = captured.recv().expect("captured request");
        assert!(raw.starts_with("POST /v1/chat/completions"));
        let lowered = raw.to_ascii_lowercase();
        assert!(lowered.contains("authorization: bearer sk-test"));
        assert!(!lowered.contains("x-client-request-id"));
    }

    #[test]
    fn correlation_id_is_sent_as_a_header() {
        let body = json!({ "choices": [{ "message": { "content": "ok" } }] }).to_string();
        let (url, captured, handle) = spawn_server("200 OK", body);

        let mut tagged = request(None, None);
        tagged.correlation_id = Some("run".to_string());
        OpenAiHttpTransport::new(&url)
            .dispatch(&tagged, Some("sk-test"))
            .expect("completion");
        handle.join().expect("server thread");

        let raw = captured.recv().expect("captured request");
        assert!(raw.to_ascii_lowercase().contains("x-client-request-id: run"));
    }

    #[test]
    fn sends_schema_and_image_parts() {
        let body = json!({ "choices": [{ "message": { "content": "{}" } }] }).to_string();
        let (url, captured, handle) = spawn_server("200 OK", body);

        let transport = OpenAiHttpTransport::new(&url);
        let response = transport
            .dispatch(
                &request(Some(json!({ "type": "object" })), Some("data:image/png;base64,AAAA")),
                Some("sk-test"),
            )
            .expect("completion");
        handle.join().expect("server thread");
        assert_eq!(response.usage.total_tokens, None);

        let raw = captured.recv().expect("captured request");
        let (_, payload) = raw.split_once("\r\n\r\n").expect("body");
        let payload: Value = serde_json::from_str(payload).expect("json body");
        assert_eq!(payload["response_format"]["type"], "json_schema");
        assert_eq!(payload["messages"][0]["role"], "system");
        assert_eq!(
            payload["messages"][1]["content"][1]["image_url"]["url"],
            "data:image/png;base64,AAAA"
        );
        assert_eq!(payload["max_tokens"], 64);
    }

    #[test]
    fn server_errors_are_retryable_and_auth_errors_are_not() {
        let (url, _captured, handle) = spawn_server("503 Service Unavailable", "{}".to_string());
        let err = OpenAiHttpTransport::new(&url)
            .dispatch(&request(None, None), Some("sk-test"))
            .expect_err("503");
        handle.join().expect("server thread");
        assert!(err.is_retryable());

        let (url, _captured, handle) = spawn_server("401 Unauthorized", "{}".to_string());
        let err = OpenAiHttpTransport::new(&url)
            .dispatch(&request(None, None), Some("sk-test"))
            .expect_err("401");
        handle.join().expect("server thread");
        assert!(!err.is_retryable());
    }

    #[test]
    fn missing_key_fails_before_any_network_call() {
        let url = Url::parse("http://127.0.0.1:9/v1").expect("url");
        let err = OpenAiHttpTransport::new(&url)
            .dispatch(&request(None, None), None)
            .expect_err("no key");
        assert!(!err.is_retryable());
    }
}
