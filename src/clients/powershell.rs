use std::path::PathBuf;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Client;
use serde::Deserialize;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clients::{ClientError, RawTrace, TraceClient};
use crate::db::models::{AuthMethod, Tenant};
use crate::normalize::SourceKind;

const EXO_SCOPE: &str = "https://outlook.office365.com/.default";
const SCRIPT_TIMEOUT_SECONDS: u64 = 600;
const MAX_PAGE_SIZE: usize = 5000;

/// Exchange Online PowerShell transport. Drives the ExchangeOnlineManagement
/// module through a disposable script; used directly or as the fallback when
/// the Graph trace endpoint is unavailable for a tenant.
pub struct PowershellClient {
    tenant_name: String,
    client_id: String,
    tenant_id: String,
    organization: String,
    auth_method: AuthMethod,
    client_secret: Option<String>,
    certificate_thumbprint: Option<String>,
    /// Pre-fetched Exchange token for secret-auth tenants.
    access_token: Option<String>,
    http: Client,
}

impl PowershellClient {
    pub fn new(tenant: &Tenant) -> Result<Self, ClientError> {
        let organization = tenant.organization_value().ok_or_else(|| {
            ClientError::Config(format!(
                "tenant '{}' has no organization; the PowerShell backend requires one \
                 (for example contoso.onmicrosoft.com)",
                tenant.name
            ))
        })?;

        match tenant.auth_method {
            AuthMethod::Certificate => {
                if tenant
                    .certificate_thumbprint
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .is_none()
                {
                    return Err(ClientError::Config(format!(
                        "tenant '{}' uses certificate auth but has no certificate_thumbprint; \
                         the PowerShell backend connects by thumbprint",
                        tenant.name
                    )));
                }
            }
            AuthMethod::Secret => {
                if tenant
                    .client_secret
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .is_none()
                {
                    return Err(ClientError::Config(format!(
                        "tenant '{}' uses secret auth but has no client_secret",
                        tenant.name
                    )));
                }
            }
        }

        Ok(Self {
            tenant_name: tenant.name.clone(),
            client_id: tenant.client_id.clone(),
            tenant_id: tenant.tenant_id.clone(),
            organization: organization.to_string(),
            auth_method: tenant.auth_method,
            client_secret: tenant.client_secret.clone(),
            certificate_thumbprint: tenant.certificate_thumbprint.clone(),
            access_token: None,
            http: Client::new(),
        })
    }

    async fn fetch_exchange_token(&self) -> Result<String, ClientError> {
        let secret = self
            .client_secret
            .as_deref()
            .ok_or_else(|| ClientError::Config("client_secret missing".to_string()))?;

        let token_url = std::env::var("ETA_TOKEN_URL")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| {
                format!(
                    "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
                    self.tenant_id
                )
            });

        let response = self
            .http
            .post(&token_url)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", secret),
                ("scope", EXO_SCOPE),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await
            .map_err(|e| ClientError::Auth(format!("exchange token request: {e}")))?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ClientError::Auth(format!(
                "exchange token request failed: status={status}"
            )));
        }

        let payload: ExchangeTokenResponse = serde_json::from_str(&body)
            .map_err(|e| ClientError::Auth(format!("decode exchange token response: {e}")))?;
        Ok(payload.access_token)
    }

    fn connect_block(&self) -> String {
        match self.auth_method {
            AuthMethod::Certificate => format!(
                "Connect-ExchangeOnline -AppId '{}' -CertificateThumbprint '{}' \
                 -Organization '{}' -ShowBanner:$false",
                escape_single_quoted(&self.client_id),
                escape_single_quoted(self.certificate_thumbprint.as_deref().unwrap_or_default()),
                escape_single_quoted(&self.organization),
            ),
            AuthMethod::Secret => format!(
                "Connect-ExchangeOnline -AccessToken '{}' -Organization '{}' -ShowBanner:$false",
                escape_single_quoted(self.access_token.as_deref().unwrap_or_default()),
                escape_single_quoted(&self.organization),
            ),
        }
    }

    fn build_script(&self, start: DateTime<Utc>, end: DateTime<Utc>, page_size: usize) -> String {
        let page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        let start = start.to_rfc3339_opts(SecondsFormat::Secs, true);
        let end = end.to_rfc3339_opts(SecondsFormat::Secs, true);

        format!(
            r#"$ErrorActionPreference = 'Stop'
Import-Module ExchangeOnlineManagement
{connect}
$fields = @('MessageId','Received','SenderAddress','RecipientAddress','Subject','Status','Size','ToIP','FromIP','MessageTraceId')
$all = @()
if (Get-Command Get-MessageTraceV2 -ErrorAction SilentlyContinue) {{
    $all = Get-MessageTraceV2 -StartDate '{start}' -EndDate '{end}' -ResultSize {page_size} | Select-Object $fields
}} else {{
    $page = 1
    do {{
        $batch = @(Get-MessageTrace -StartDate '{start}' -EndDate '{end}' -Page $page -PageSize {page_size} | Select-Object $fields)
        $all += $batch
        $page += 1
    }} while ($batch.Count -eq {page_size})
}}
$all | ConvertTo-Json -Compress -Depth 4
Disconnect-ExchangeOnline -Confirm:$false | Out-Null
"#,
            connect = self.connect_block(),
        )
    }

    async fn run_script(&self, script: &str) -> Result<String, ClientError> {
        let executable = powershell_executable().ok_or_else(|| {
            ClientError::Config(
                "no PowerShell executable found; install pwsh or powershell".to_string(),
            )
        })?;

        let script_path = std::env::temp_dir().join(format!("eta-{}.ps1", Uuid::new_v4()));
        std::fs::write(&script_path, script)
            .map_err(|e| ClientError::Api(format!("write temp script: {e}")))?;
        let _cleanup = ScriptCleanup(script_path.clone());

        debug!(tenant = %self.tenant_name, executable = %executable, "running powershell trace script");

        let run = Command::new(&executable)
            .arg("-NoProfile")
            .arg("-NonInteractive")
            .arg("-ExecutionPolicy")
            .arg("Bypass")
            .arg("-File")
            .arg(&script_path)
            .output();

        let output = match timeout(StdDuration::from_secs(SCRIPT_TIMEOUT_SECONDS), run).await {
            Ok(result) => result.map_err(|e| ClientError::Api(format!("spawn {executable}: {e}")))?,
            Err(_) => {
                return Err(ClientError::Timeout {
                    seconds: SCRIPT_TIMEOUT_SECONDS,
                })
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ClientError::Api(format!(
                "powershell exited with {}: {}",
                output.status,
                stderr.trim().chars().take(500).collect::<String>()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait(?Send)]
impl TraceClient for PowershellClient {
    fn name(&self) -> &str {
        "powershell"
    }

    fn source(&self) -> SourceKind {
        SourceKind::Powershell
    }

    async fn authenticate(&mut self) -> Result<(), ClientError> {
        if self.auth_method == AuthMethod::Secret && self.access_token.is_none() {
            let token = self.fetch_exchange_token().await?;
            self.access_token = Some(token);
        }
        Ok(())
    }

    async fn fetch_traces(
        &mut self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        page_size: usize,
    ) -> Result<Vec<RawTrace>, ClientError> {
        self.authenticate().await?;

        let script = self.build_script(start, end, page_size);
        let stdout = self.run_script(&script).await?;
        parse_script_output(&stdout)
    }
}

/// Parses ConvertTo-Json output. A single trace serializes as a bare object,
/// which is wrapped into a one-element list; empty output means no traces.
fn parse_script_output(stdout: &str) -> Result<Vec<RawTrace>, ClientError> {
    // The JSON is the last non-empty line; connect banners land before it.
    let payload = stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| line.starts_with('[') || line.starts_with('{'));

    let Some(payload) = payload else {
        return Ok(Vec::new());
    };

    let value: serde_json::Value = serde_json::from_str(payload)
        .map_err(|e| ClientError::Api(format!("powershell emitted malformed JSON: {e}")))?;

    match value {
        serde_json::Value::Array(items) => Ok(items),
        object @ serde_json::Value::Object(_) => Ok(vec![object]),
        other => Err(ClientError::Api(format!(
            "powershell emitted unexpected JSON type: {other}"
        ))),
    }
}

/// Finds pwsh (preferred) or powershell on PATH. Overridable for tests.
fn powershell_executable() -> Option<String> {
    if let Ok(explicit) = std::env::var("ETA_POWERSHELL_BIN") {
        let explicit = explicit.trim();
        if !explicit.is_empty() {
            return Some(explicit.to_string());
        }
    }

    let path = std::env::var_os("PATH")?;
    for candidate in ["pwsh", "pwsh.exe", "powershell", "powershell.exe"] {
        for dir in std::env::split_paths(&path) {
            let full = dir.join(candidate);
            if full.is_file() {
                return Some(full.to_string_lossy().into_owned());
            }
        }
    }
    None
}

fn escape_single_quoted(value: &str) -> String {
    value.replace('\'', "''")
}

/// Removes the temp script when the fetch ends, on success or error.
struct ScriptCleanup(PathBuf);

impl Drop for ScriptCleanup {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.0) {
            if self.0.exists() {
                warn!(path = %self.0.display(), error = %e, "failed to remove temp script");
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ExchangeTokenResponse {
    access_token: String,
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::{escape_single_quoted, parse_script_output, PowershellClient, ScriptCleanup};
    use crate::clients::ClientError;
    use crate::db::models::{ApiMethod, AuthMethod, Tenant};

    fn tenant(auth: AuthMethod) -> Tenant {
        Tenant {
            id: 1,
            name: "contoso".to_string(),
            tenant_id: "tid".to_string(),
            client_id: "cid".to_string(),
            auth_method: auth,
            client_secret: Some("s3cret".to_string()),
            certificate_path: None,
            certificate_thumbprint: Some("ABCDEF".to_string()),
            certificate_password: None,
            api_method: ApiMethod::Powershell,
            organization: Some("contoso.onmicrosoft.com".to_string()),
            domains: None,
            domains_last_updated: None,
            is_active: true,
        }
    }

    #[test]
    fn missing_organization_is_a_config_error() {
        let mut t = tenant(AuthMethod::Secret);
        t.organization = None;
        let err = PowershellClient::new(&t).err().expect("construction fails");
        assert!(matches!(err, ClientError::Config(_)));
        assert!(err.to_string().contains("organization"));
    }

    #[test]
    fn certificate_auth_requires_thumbprint() {
        let mut t = tenant(AuthMethod::Certificate);
        t.certificate_thumbprint = None;
        assert!(PowershellClient::new(&t).is_err());
    }

    #[test]
    fn script_connects_by_thumbprint_and_caps_page_size() {
        let client = PowershellClient::new(&tenant(AuthMethod::Certificate)).expect("build client");
        let start = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2026, 2, 2, 0, 0, 0).unwrap();

        let script = client.build_script(start, end, 9999);
        assert!(script.contains("-CertificateThumbprint 'ABCDEF'"));
        assert!(script.contains("-Organization 'contoso.onmicrosoft.com'"));
        assert!(script.contains("Get-MessageTraceV2"));
        assert!(script.contains("Get-MessageTrace "));
        assert!(script.contains("5000"));
        assert!(!script.contains("9999"));
    }

    #[test]
    fn single_object_output_is_wrapped_into_a_list() {
        let traces = parse_script_output(r#"{"MessageId":"<a@b>","Status":"Delivered"}"#)
            .expect("parse object");
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0]["MessageId"], "<a@b>");

        let traces =
            parse_script_output(r#"[{"MessageId":"<a@b>"},{"MessageId":"<c@d>"}]"#).expect("parse array");
        assert_eq!(traces.len(), 2);
    }

    #[test]
    fn empty_or_bannered_output_yields_no_traces() {
        assert!(parse_script_output("").expect("empty").is_empty());
        assert!(parse_script_output("Welcome banner\n\n").expect("banner only").is_empty());

        let with_banner = "Some module banner\n[{\"MessageId\":\"<a@b>\"}]";
        assert_eq!(parse_script_output(with_banner).expect("skip banner").len(), 1);
    }

    #[test]
    fn malformed_json_is_an_api_error() {
        let err = parse_script_output("{not json").err().expect("parse fails");
        assert!(matches!(err, ClientError::Api(_)));
    }

    #[test]
    fn temp_script_is_removed_on_drop() {
        let path = std::env::temp_dir().join(format!("eta-{}.ps1", uuid::Uuid::new_v4()));
        std::fs::write(&path, "Write-Output 'hi'").expect("write script");
        {
            let _cleanup = ScriptCleanup(path.clone());
        }
        assert!(!path.exists());
    }

    #[test]
    fn single_quotes_are_doubled() {
        assert_eq!(escape_single_quoted("o'brien"), "o''brien");
    }
}
