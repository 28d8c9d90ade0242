//! [`AutomationSession`] over the W3C WebDriver wire protocol (chromedriver).

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde_json::{json, Value};
use std::io::Read;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use super::{
    is_loaded_image_src, Actionability, AutomationSession, CancelToken, Deadline, Locator,
    SessionFactory, SessionKill, UploadOutcome,
};
use crate::config::WebDriverConfig;
use crate::error::AutomationError;
use crate::model::WorkerId;

/// Key under which the protocol returns element references.
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

/// Largest result artifact accepted from a download.
const MAX_RESOURCE_BYTES: u64 = 64 * 1024 * 1024;

struct WireClient {
    agent: ureq::Agent,
    endpoint: String,
}

impl WireClient {
    fn new(endpoint: &str) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(60))
            .build();
        Self {
            agent,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        }
    }

    fn request(&self, method: &str, path: &str, body: Option<Value>) -> Result<Value, AutomationError> {
        let url = format!("{}{}", self.endpoint, path);
        let req = self.agent.request(method, &url);
        let result = match body {
            Some(body) => req.send_json(body),
            None => req.call(),
        };

        match result {
            Ok(response) => {
                let body: Value = response
                    .into_json()
                    .map_err(|e| AutomationError::Protocol(format!("invalid response: {}", e)))?;
                Ok(body.get("value").cloned().unwrap_or(Value::Null))
            }
            Err(ureq::Error::Status(_, response)) => {
                let body: Value = response.into_json().unwrap_or(Value::Null);
                Err(classify_error(&body["value"]))
            }
            Err(ureq::Error::Transport(e)) => Err(AutomationError::Transport(e.to_string())),
        }
    }

    fn new_session(&self, capabilities: &Value) -> Result<String, AutomationError> {
        let value = self.request("POST", "/session", Some(capabilities.clone()))?;
        value["sessionId"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| AutomationError::Protocol("no sessionId in new session response".into()))
    }

    fn delete_session(&self, id: &str) {
        if let Err(e) = self.request("DELETE", &format!("/session/{}", id), None) {
            tracing::debug!(session = id, error = %e, "Deleting WebDriver session failed");
        }
    }
}

fn classify_error(value: &Value) -> AutomationError {
    let code = value["error"].as_str().unwrap_or("unknown error");
    let message = value["message"].as_str().unwrap_or(code).to_string();
    match code {
        "no such element" => AutomationError::NotFound(message),
        "stale element reference" => AutomationError::StaleElement(message),
        "element click intercepted" | "element not interactable" => {
            AutomationError::ClickIntercepted(message)
        }
        "timeout" | "script timeout" => AutomationError::Timeout(message),
        "invalid session id" | "no such window" | "session not created" => {
            AutomationError::SessionLost(message)
        }
        _ => AutomationError::Protocol(format!("{}: {}", code, message)),
    }
}

/// Creates one chromedriver session per runner.
pub struct WebDriverFactory {
    client: Arc<WireClient>,
    args: Vec<String>,
    upload_poll: Duration,
}

impl WebDriverFactory {
    pub fn new(config: &WebDriverConfig, upload_poll: Duration) -> Self {
        Self {
            client: Arc::new(WireClient::new(&config.endpoint)),
            args: config.args.clone(),
            upload_poll,
        }
    }

    fn capabilities(&self, headless: bool) -> Value {
        let mut args = self.args.clone();
        if headless {
            args.push("--headless=new".to_string());
            args.push("--disable-gpu".to_string());
        }
        json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "goog:chromeOptions": {
                        "args": args,
                        "excludeSwitches": ["enable-logging"],
                    }
                }
            }
        })
    }
}

impl SessionFactory for WebDriverFactory {
    fn create(
        &self,
        worker: &WorkerId,
        headless: bool,
    ) -> Result<Box<dyn AutomationSession>, AutomationError> {
        let capabilities = self.capabilities(headless);
        let id = self.client.new_session(&capabilities)?;
        tracing::info!(worker = %worker, session = %id, headless, "WebDriver session created");

        Ok(Box::new(WebDriverSession {
            client: self.client.clone(),
            session_id: Arc::new(Mutex::new(Some(id))),
            capabilities,
            upload_poll: self.upload_poll,
        }))
    }
}

pub struct WebDriverSession {
    client: Arc<WireClient>,
    /// Shared with the kill handle so a restart is visible to it.
    session_id: Arc<Mutex<Option<String>>>,
    capabilities: Value,
    upload_poll: Duration,
}

struct WebDriverKill {
    client: Arc<WireClient>,
    session_id: Arc<Mutex<Option<String>>>,
}

impl SessionKill for WebDriverKill {
    fn terminate(&self) {
        let id = self
            .session_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(id) = id {
            tracing::warn!(session = %id, "Force-closing WebDriver session");
            self.client.delete_session(&id);
        }
    }
}

impl WebDriverSession {
    fn path(&self, suffix: &str) -> Result<String, AutomationError> {
        let guard = self.session_id.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_deref() {
            Some(id) => Ok(format!("/session/{}{}", id, suffix)),
            None => Err(AutomationError::SessionLost("session closed".into())),
        }
    }

    fn command(&self, method: &str, suffix: &str, body: Option<Value>) -> Result<Value, AutomationError> {
        let path = self.path(suffix)?;
        self.client.request(method, &path, body)
    }

    fn find_element(&self, locator: &Locator) -> Result<String, AutomationError> {
        let value = self.command(
            "POST",
            "/element",
            Some(json!({ "using": "xpath", "value": locator.as_str() })),
        )?;
        value[ELEMENT_KEY]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| AutomationError::Protocol("malformed element reference".into()))
    }

    fn element_command(
        &self,
        locator: &Locator,
        method: &str,
        suffix: &str,
        body: Option<Value>,
    ) -> Result<Value, AutomationError> {
        let element = self.find_element(locator)?;
        self.command(method, &format!("/element/{}{}", element, suffix), body)
    }

    fn image_src(&self, locator: &Locator) -> Option<String> {
        self.element_command(locator, "GET", "/attribute/src", None)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .filter(|src| is_loaded_image_src(src))
    }
}

impl AutomationSession for WebDriverSession {
    fn navigate(&mut self, url: &str) -> Result<(), AutomationError> {
        self.command("POST", "/url", Some(json!({ "url": url })))?;
        Ok(())
    }

    fn current_url(&mut self) -> Option<String> {
        self.command("GET", "/url", None)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
    }

    fn upload_and_await_confirmation(
        &mut self,
        input: &Locator,
        file: &Path,
        confirmation: &Locator,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> UploadOutcome {
        if !file.is_file() {
            return UploadOutcome::Error(AutomationError::NotFound(format!(
                "upload file {}",
                file.display()
            )));
        }

        let previous = self.image_src(confirmation);
        let text = file.to_string_lossy().to_string();
        if let Err(e) = self.element_command(input, "POST", "/value", Some(json!({ "text": text }))) {
            return UploadOutcome::Error(e);
        }

        let deadline = Deadline::after(timeout);
        while !deadline.expired() {
            if cancel.is_cancelled() {
                return UploadOutcome::Stopped;
            }
            if let Some(src) = self.image_src(confirmation) {
                if previous.as_deref() != Some(src.as_str()) {
                    return UploadOutcome::Success;
                }
            }
            if cancel.wait_timeout(self.upload_poll.min(deadline.remaining())) {
                return UploadOutcome::Stopped;
            }
        }
        UploadOutcome::Timeout
    }

    fn is_actionable(&mut self, locator: &Locator) -> Actionability {
        match self.element_command(locator, "GET", "/enabled", None) {
            Ok(Value::Bool(true)) => Actionability::Enabled,
            Ok(_) => Actionability::Disabled,
            Err(_) => Actionability::NotFound,
        }
    }

    fn click(&mut self, locator: &Locator) -> Result<(), AutomationError> {
        self.element_command(locator, "POST", "/click", Some(json!({})))?;
        Ok(())
    }

    fn find_text(&mut self, locator: &Locator) -> Option<String> {
        self.element_command(locator, "GET", "/text", None)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
    }

    fn find_attribute(&mut self, locator: &Locator, name: &str) -> Option<String> {
        self.element_command(locator, "GET", &format!("/attribute/{}", name), None)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
    }

    fn element_visible(&mut self, locator: &Locator) -> bool {
        matches!(
            self.element_command(locator, "GET", "/displayed", None),
            Ok(Value::Bool(true))
        )
    }

    fn clear_site_data(&mut self) -> Result<(), AutomationError> {
        self.command(
            "POST",
            "/execute/sync",
            Some(json!({
                "script": "window.localStorage.clear(); window.sessionStorage.clear();",
                "args": [],
            })),
        )?;
        self.command("DELETE", "/cookie", None)?;
        Ok(())
    }

    fn refresh(&mut self) -> Result<(), AutomationError> {
        self.command("POST", "/refresh", Some(json!({})))?;
        Ok(())
    }

    fn hard_restart_session(&mut self) -> Result<(), AutomationError> {
        self.kill_handle().terminate();
        let id = self.client.new_session(&self.capabilities)?;
        tracing::info!(session = %id, "WebDriver session restarted");
        *self.session_id.lock().unwrap_or_else(PoisonError::into_inner) = Some(id);
        Ok(())
    }

    fn fetch_resource(&mut self, url: &str, timeout: Duration) -> Result<Vec<u8>, AutomationError> {
        if let Some(rest) = url.strip_prefix("data:") {
            return decode_data_url(rest);
        }
        if !url.starts_with("http") {
            return Err(AutomationError::Unsupported(format!("cannot fetch {}", url)));
        }

        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        let response = agent
            .get(url)
            .call()
            .map_err(|e| AutomationError::Transport(format!("GET {}: {}", url, e)))?;

        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_RESOURCE_BYTES)
            .read_to_end(&mut bytes)
            .map_err(|e| AutomationError::Transport(e.to_string()))?;
        Ok(bytes)
    }

    fn kill_handle(&self) -> Arc<dyn SessionKill> {
        Arc::new(WebDriverKill {
            client: self.client.clone(),
            session_id: self.session_id.clone(),
        })
    }

    fn close(&mut self) {
        self.kill_handle().terminate();
    }
}

fn decode_data_url(rest: &str) -> Result<Vec<u8>, AutomationError> {
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| AutomationError::Protocol("malformed data URL".into()))?;
    if header.ends_with(";base64") {
        BASE64
            .decode(payload.trim())
            .map_err(|e| AutomationError::Protocol(format!("bad base64 payload: {}", e)))
    } else {
        Ok(payload.as_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_error() {
        let err = classify_error(&json!({ "error": "no such element", "message": "nope" }));
        assert_eq!(err, AutomationError::NotFound("nope".into()));

        let err = classify_error(&json!({ "error": "invalid session id" }));
        assert!(matches!(err, AutomationError::SessionLost(_)));
        assert!(!err.is_transient());

        let err = classify_error(&Value::Null);
        assert!(matches!(err, AutomationError::Protocol(_)));
    }

    #[test]
    fn test_decode_data_url() {
        let bytes = decode_data_url("image/png;base64,aGVsbG8=").unwrap();
        assert_eq!(bytes, b"hello");

        let bytes = decode_data_url("text/plain,raw").unwrap();
        assert_eq!(bytes, b"raw");

        assert!(decode_data_url("no-comma").is_err());
    }

    #[test]
    fn test_capabilities_include_headless_switches() {
        let factory = WebDriverFactory::new(&WebDriverConfig::default(), Duration::from_millis(500));
        let caps = factory.capabilities(true);
        let args = caps["capabilities"]["alwaysMatch"]["goog:chromeOptions"]["args"]
            .as_array()
            .unwrap();
        assert!(args.iter().any(|a| a == "--headless=new"));

        let caps = factory.capabilities(false);
        let args = caps["capabilities"]["alwaysMatch"]["goog:chromeOptions"]["args"]
            .as_array()
            .unwrap();
        assert!(!args.iter().any(|a| a == "--headless=new"));
    }
}
