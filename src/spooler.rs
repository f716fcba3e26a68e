use crate::errors::{DaemonError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Snapshot of a job held by the host print spooler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpoolEntry {
    pub id: u32,
    pub document: String,
    pub owner: String,
    /// All status flags joined into one string, e.g. "Printing, Retained"
    pub raw_status: String,
    pub pages_printed: u32,
    pub total_pages: u32,
}

/// A printer installed on the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrinterInfo {
    pub name: String,
    pub is_default: bool,
}

/// Read-only view of the host spooler.
///
/// `Ok(None)` means the job is not (or no longer) in the spool, which is a
/// normal condition. `Err` means the query itself failed and says nothing
/// about the job.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SpoolerProbe: Send + Sync {
    /// Most recently submitted job on the printer.
    async fn latest(&self, printer_name: &str) -> Result<Option<SpoolEntry>>;

    async fn by_id(&self, printer_name: &str, job_id: u32) -> Result<Option<SpoolEntry>>;

    /// Printers a queue can be started on.
    async fn printers(&self) -> Result<Vec<PrinterInfo>>;
}

// ============================================================================
// PowerShell-backed probe (Windows spooler)
// ============================================================================

const PWSH_ARGS: [&str; 4] = ["-NoLogo", "-NoProfile", "-NonInteractive", "-Command"];

/// Queries the Windows spooler through PowerShell.
///
/// Each lookup tries the PrintManagement module (`Get-PrintJob`) and falls
/// back to WMI (`Win32_PrintJob`) when that yields nothing.
pub struct PowerShellProbe {
    shell: PathBuf,
    query_timeout: Duration,
}

impl PowerShellProbe {
    pub fn new(query_timeout: Duration) -> Self {
        let shell = resolve_powershell();
        debug!("Spooler probe using {:?}", shell);
        Self {
            shell,
            query_timeout,
        }
    }

    pub fn with_shell(shell: impl Into<PathBuf>, query_timeout: Duration) -> Self {
        Self {
            shell: shell.into(),
            query_timeout,
        }
    }

    /// Run one script; stdout is returned trimmed.
    async fn run(&self, script: &str) -> Result<String> {
        run_powershell(&self.shell, script, self.query_timeout).await
    }

    async fn query(&self, management: String, wmi: String) -> Result<Option<SpoolEntry>> {
        match self.run(&management).await {
            Ok(out) => {
                if let Some(entry) = parse_job_output(&out)? {
                    return Ok(Some(entry));
                }
            }
            // The module may be missing on older hosts; WMI decides
            Err(e) => debug!("Get-PrintJob query failed, trying WMI: {}", e),
        }

        let out = self.run(&wmi).await?;
        parse_job_output(&out)
    }
}

#[async_trait]
impl SpoolerProbe for PowerShellProbe {
    #[tracing::instrument(skip(self))]
    async fn latest(&self, printer_name: &str) -> Result<Option<SpoolEntry>> {
        let p = escape_ps_string(printer_name);
        let management = format!(
            r#"Try {{
  $j = Get-PrintJob -PrinterName "{p}" -ErrorAction Stop | Sort-Object -Property SubmittedTime -Descending | Select-Object -First 1
  if ($j) {{
    $s = $j.JobStatus
    if ($s -is [array]) {{ $s = ($s -join ", ") }} elseif ($s) {{ $s = [string]$s }} else {{ $s = "" }}
    [pscustomobject]@{{ Id = $j.Id; Document = $j.DocumentName; UserName = $j.UserName; JobStatusText = $s; PagesPrinted = $j.PagesPrinted; TotalPages = $j.TotalPages }} | ConvertTo-Json -Compress
  }} else {{ "" }}
}} Catch {{ "" }}"#
        );
        let wmi = format!(
            r#"Try {{
  $j = Get-WmiObject Win32_PrintJob -ErrorAction Stop | Where-Object {{ $_.Name -like "{p},*" }} | Sort-Object -Property TimeSubmitted -Descending | Select-Object -First 1
  if ($j) {{
    $s = $j.Status
    if ($s -is [array]) {{ $s = ($s -join ", ") }} elseif ($s) {{ $s = [string]$s }} else {{ $s = "" }}
    [pscustomobject]@{{ Id = $j.JobId; Document = $j.Document; UserName = $j.Owner; JobStatusText = $s; PagesPrinted = $j.PagesPrinted; TotalPages = $j.TotalPages }} | ConvertTo-Json -Compress
  }} else {{ "" }}
}} Catch {{ [Console]::Error.WriteLine($_.Exception.Message); exit 1 }}"#
        );
        self.query(management, wmi).await
    }

    #[tracing::instrument(skip(self))]
    async fn by_id(&self, printer_name: &str, job_id: u32) -> Result<Option<SpoolEntry>> {
        let p = escape_ps_string(printer_name);
        let management = format!(
            r#"Try {{
  $j = Get-PrintJob -PrinterName "{p}" -ID {job_id} -ErrorAction Stop
  if ($j) {{
    $s = $j.JobStatus
    if ($s -is [array]) {{ $s = ($s -join ", ") }} elseif ($s) {{ $s = [string]$s }} else {{ $s = "" }}
    [pscustomobject]@{{ Id = $j.Id; Document = $j.DocumentName; UserName = $j.UserName; JobStatusText = $s; PagesPrinted = $j.PagesPrinted; TotalPages = $j.TotalPages }} | ConvertTo-Json -Compress
  }} else {{ "" }}
}} Catch {{ "" }}"#
        );
        let wmi = format!(
            r#"Try {{
  $j = Get-WmiObject Win32_PrintJob -ErrorAction Stop | Where-Object {{ $_.JobId -eq {job_id} -and $_.Name -like "{p},*" }} | Select-Object -First 1
  if ($j) {{
    $s = $j.Status
    if ($s -is [array]) {{ $s = ($s -join ", ") }} elseif ($s) {{ $s = [string]$s }} else {{ $s = "" }}
    [pscustomobject]@{{ Id = $j.JobId; Document = $j.Document; UserName = $j.Owner; JobStatusText = $s; PagesPrinted = $j.PagesPrinted; TotalPages = $j.TotalPages }} | ConvertTo-Json -Compress
  }} else {{ "" }}
}} Catch {{ [Console]::Error.WriteLine($_.Exception.Message); exit 1 }}"#
        );
        self.query(management, wmi).await
    }

    #[cfg(windows)]
    #[tracing::instrument(skip(self))]
    async fn printers(&self) -> Result<Vec<PrinterInfo>> {
        let script = r#"Try {
  $d = (Get-CimInstance Win32_Printer -Filter "Default=True" -ErrorAction SilentlyContinue | Select-Object -First 1).Name
  @(Get-Printer -ErrorAction Stop | ForEach-Object { [pscustomobject]@{ Name = $_.Name; IsDefault = ($_.Name -eq $d) } }) | ConvertTo-Json -Compress
} Catch {
  @(Get-WmiObject Win32_Printer -ErrorAction Stop | ForEach-Object { [pscustomobject]@{ Name = $_.Name; IsDefault = [bool]$_.Default } }) | ConvertTo-Json -Compress
}"#;
        let out = self.run(script).await?;
        parse_printer_output(&out)
    }

    #[cfg(not(windows))]
    #[tracing::instrument(skip(self))]
    async fn printers(&self) -> Result<Vec<PrinterInfo>> {
        let names = run_lpstat("-e", self.query_timeout).await?;
        // No default destination is not an error
        let default = run_lpstat("-d", self.query_timeout)
            .await
            .unwrap_or_default();
        Ok(parse_lpstat(&names, &default))
    }
}

#[cfg(not(windows))]
async fn run_lpstat(flag: &str, limit: Duration) -> Result<String> {
    let child = Command::new("lpstat")
        .arg(flag)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| DaemonError::Spooler(format!("failed to start lpstat: {}", e)))?;

    let output = tokio::time::timeout(limit, child.wait_with_output())
        .await
        .map_err(|_| DaemonError::Spooler(format!("lpstat timed out after {}ms", limit.as_millis())))??;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(DaemonError::Spooler(format!("lpstat {} failed: {}", flag, stderr)));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Combine `lpstat -e` (one destination per line) with `lpstat -d`
/// ("system default destination: NAME").
pub fn parse_lpstat(names: &str, default: &str) -> Vec<PrinterInfo> {
    let default = default
        .lines()
        .find_map(|line| line.split_once(':').map(|(_, name)| name.trim()))
        .filter(|name| !name.is_empty());

    names
        .lines()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| PrinterInfo {
            name: name.to_string(),
            is_default: Some(name) == default,
        })
        .collect()
}

/// Parse the printer list a PowerShell script printed as JSON.
pub fn parse_printer_output(out: &str) -> Result<Vec<PrinterInfo>> {
    let out = out.trim();
    if out.is_empty() || out == "\"\"" {
        return Ok(Vec::new());
    }

    let value: Value = serde_json::from_str(out)
        .map_err(|e| DaemonError::Spooler(format!("unreadable printer list: {}", e)))?;
    let items = match value {
        Value::Array(items) => items,
        single @ Value::Object(_) => vec![single],
        _ => Vec::new(),
    };

    Ok(items
        .iter()
        .filter_map(|item| {
            let name = string_field(item, &["Name", "name"]).filter(|n| !n.is_empty())?;
            let is_default = matches!(item.get("IsDefault"), Some(Value::Bool(true)));
            Some(PrinterInfo { name, is_default })
        })
        .collect())
}

/// Spawn PowerShell with `script`, bounded by `limit`.
///
/// Some providers write to stderr and exit non-zero even when they produced
/// the JSON we asked for, so non-empty stdout wins over the exit code.
pub(crate) async fn run_powershell(shell: &Path, script: &str, limit: Duration) -> Result<String> {
    let child = Command::new(shell)
        .args(PWSH_ARGS)
        .arg(script)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| DaemonError::Spooler(format!("failed to start {}: {}", shell.display(), e)))?;

    let output = tokio::time::timeout(limit, child.wait_with_output())
        .await
        .map_err(|_| {
            warn!("PowerShell query exceeded {:?}", limit);
            DaemonError::Spooler(format!("query timed out after {}ms", limit.as_millis()))
        })??;

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if output.status.success() || !stdout.is_empty() {
        return Ok(stdout);
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    Err(DaemonError::Spooler(if stderr.is_empty() {
        format!("PowerShell exited with {}", output.status)
    } else {
        stderr
    }))
}

/// Locate a PowerShell executable: installed PowerShell 7, then Windows
/// PowerShell 5.1, then whatever `powershell.exe` is on PATH.
pub(crate) fn resolve_powershell() -> PathBuf {
    let ps7 = PathBuf::from(r"C:\Program Files\PowerShell\7\pwsh.exe");
    if ps7.exists() {
        return ps7;
    }

    let system_root = std::env::var("SystemRoot").unwrap_or_else(|_| r"C:\Windows".to_string());
    // 32-bit process on 64-bit Windows must go through Sysnative
    let system_dir = if std::env::var_os("PROCESSOR_ARCHITEW6432").is_some() {
        "Sysnative"
    } else {
        "System32"
    };
    let ps51 = Path::new(&system_root)
        .join(system_dir)
        .join("WindowsPowerShell")
        .join("v1.0")
        .join("powershell.exe");
    if ps51.exists() {
        return ps51;
    }

    PathBuf::from("powershell.exe")
}

/// Escape a value for a double-quoted PowerShell string.
pub(crate) fn escape_ps_string(s: &str) -> String {
    s.replace('`', "``").replace('"', "\"\"").replace('$', "`$")
}

/// Parse the JSON a query script printed. Blank output (or a bare `""`)
/// means no job.
pub(crate) fn parse_job_output(out: &str) -> Result<Option<SpoolEntry>> {
    let out = out.trim();
    if out.is_empty() || out == "\"\"" {
        return Ok(None);
    }

    let value: Value = serde_json::from_str(out)
        .map_err(|e| DaemonError::Spooler(format!("unreadable spooler output: {}", e)))?;
    let value = match value {
        Value::Array(items) => match items.into_iter().next() {
            Some(first) => first,
            None => return Ok(None),
        },
        Value::String(s) if s.is_empty() => return Ok(None),
        other => other,
    };

    entry_from_json(&value)
        .map(Some)
        .ok_or_else(|| DaemonError::Spooler(format!("spooler record without job id: {}", value)))
}

fn entry_from_json(value: &Value) -> Option<SpoolEntry> {
    let id = number_field(value, &["Id", "ID", "JobId", "id"])?;
    Some(SpoolEntry {
        id,
        document: string_field(value, &["Document", "DocumentName"]).unwrap_or_default(),
        owner: string_field(value, &["UserName", "Owner"]).unwrap_or_default(),
        raw_status: string_field(value, &["JobStatusText", "JobStatus", "Status"]).unwrap_or_default(),
        pages_printed: number_field(value, &["PagesPrinted"]).unwrap_or(0),
        total_pages: number_field(value, &["TotalPages"]).unwrap_or(0),
    })
}

fn string_field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| match value.get(*k)? {
        Value::String(s) => Some(s.clone()),
        Value::Array(parts) => Some(
            parts
                .iter()
                .filter_map(|p| p.as_str())
                .collect::<Vec<_>>()
                .join(", "),
        ),
        Value::Null => None,
        other => Some(other.to_string()),
    })
}

fn number_field(value: &Value, keys: &[&str]) -> Option<u32> {
    keys.iter().find_map(|k| match value.get(*k)? {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}
