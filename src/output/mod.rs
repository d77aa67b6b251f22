//! Output formatting and management

use crate::discovery::{Exposure, Finding, PortReport, Properties};
use crate::scanner::TargetReport;
use crate::ScanError;
use colored::{ColoredString, Colorize};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;

/// Output format options
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "txt" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Unknown output format: {}", s)),
        }
    }
}

/// Output configuration
#[derive(Debug, Clone)]
pub struct OutputConfig {
    pub format: OutputFormat,
    pub file: Option<String>,
    pub colored: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: OutputFormat::Text,
            file: None,
            colored: true,
        }
    }
}

/// Main output manager
pub struct OutputManager {
    config: OutputConfig,
}

impl OutputManager {
    pub fn new(config: OutputConfig) -> Self {
        Self { config }
    }

    /// Write scan results to the configured file, or stdout
    pub fn write_results(&self, reports: &[TargetReport]) -> crate::Result<()> {
        let output = self.render(reports)?;

        match &self.config.file {
            Some(filename) => {
                let mut file = File::create(filename)?;
                file.write_all(output.as_bytes())?;
                log::info!("Results written to {}", filename);
            }
            None => print!("{}", output),
        }
        Ok(())
    }

    pub fn render(&self, reports: &[TargetReport]) -> crate::Result<String> {
        match self.config.format {
            OutputFormat::Text => Ok(self.format_text(reports)),
            OutputFormat::Json => serde_json::to_string_pretty(reports)
                .map(|mut json| {
                    json.push('\n');
                    json
                })
                .map_err(|e| ScanError::Output(e.to_string())),
        }
    }

    /// One line per target, then one line per open port when discovery ran
    fn format_text(&self, reports: &[TargetReport]) -> String {
        let mut output = String::new();
        for report in reports {
            output.push_str(&self.target_line(report));
            output.push('\n');
            for service in &report.services {
                output.push_str(&self.service_line(service));
                output.push('\n');
                for finding in service.applications.iter().flat_map(|a| &a.findings) {
                    output.push_str(&self.finding_line(finding));
                    output.push('\n');
                }
            }
        }
        output
    }

    fn target_line(&self, report: &TargetReport) -> String {
        if !report.has_open_ports() {
            return format!("{}: {}", report.target, self.paint("no open ports", |s| s.dimmed()));
        }

        let mut parts = Vec::new();
        if !report.open_tcp.is_empty() {
            parts.push(format!("tcp {}", join_ports(&report.open_tcp)));
        }
        if !report.open_udp.is_empty() {
            parts.push(format!("udp {}", join_ports(&report.open_udp)));
        }
        format!("{}: {}", report.target, self.paint(&parts.join("  "), |s| s.green()))
    }

    fn service_line(&self, service: &PortReport) -> String {
        let mut layers = Vec::new();
        let mut properties = Vec::new();

        match &service.session {
            Some(session) => {
                layers.push(session.protocol.to_string());
                properties.extend(format_properties(&session.properties));
            }
            None => layers.push("-".to_string()),
        }
        if let Some(presentation) = &service.presentation {
            layers.push(format!(
                "{}/{}",
                presentation.protocol,
                presentation.version().unwrap_or("?")
            ));
            properties.extend(format_properties(&presentation.properties));
        }

        let application = if service.applications.is_empty() {
            self.paint("unknown", |s| s.yellow())
        } else {
            for app in &service.applications {
                properties.extend(format_properties(&app.properties));
            }
            let names: Vec<String> = service
                .applications
                .iter()
                .map(|a| a.protocol.to_string())
                .collect();
            self.paint(&names.join(","), |s| s.cyan().bold())
        };

        let mut line = format!(
            "  {}/{:<4} {} {}",
            service.port,
            service.transport.as_str(),
            layers.join(" > "),
            application
        );
        if !properties.is_empty() {
            line.push_str("  ");
            line.push_str(&properties.join(" "));
        }
        line
    }

    fn finding_line(&self, finding: &Finding) -> String {
        match &finding.exposure {
            Exposure::Vulnerable { evidence } => format!(
                "    {} {}: {}",
                self.paint("!", |s| s.red().bold()),
                finding.check,
                self.paint(evidence, |s| s.red())
            ),
            Exposure::NotVulnerable { evidence } => {
                format!("    - {}: not exposed ({})", finding.check, evidence)
            }
            Exposure::Uncorroborated { reason } => {
                format!("    ? {}: could not corroborate ({})", finding.check, reason)
            }
        }
    }

    fn paint(&self, text: &str, style: impl Fn(&str) -> ColoredString) -> String {
        if self.config.colored {
            style(text).to_string()
        } else {
            text.to_string()
        }
    }
}

fn join_ports(ports: &[u16]) -> String {
    ports.iter().map(u16::to_string).collect::<Vec<_>>().join(",")
}

fn format_properties(properties: &Properties) -> Vec<String> {
    properties.iter().map(|(key, value)| format!("{}={}", key, value)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{ApplicationProtocol, PresentationProtocol, Verdict};
    use crate::network::{ScanTarget, Transport};
    use crate::session::SessionProtocol;
    use chrono::Utc;
    use std::net::Ipv4Addr;

    fn plain() -> OutputManager {
        OutputManager::new(OutputConfig {
            colored: false,
            ..Default::default()
        })
    }

    fn report(open_tcp: Vec<u16>, services: Vec<PortReport>) -> TargetReport {
        TargetReport {
            target: ScanTarget::new(Ipv4Addr::new(192, 168, 1, 5)),
            open_tcp,
            open_udp: Vec::new(),
            services,
            attempted: 2,
            duration_ms: 12,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_no_open_ports_line() {
        let text = plain().render(&[report(Vec::new(), Vec::new())]).unwrap();
        assert_eq!(text, "192.168.1.5: no open ports\n");
    }

    #[test]
    fn test_service_lines() {
        let identified = PortReport {
            port: 6379,
            transport: Transport::Tcp,
            session: Some(Verdict::detected(SessionProtocol::Plain)),
            presentation: None,
            applications: vec![Verdict::detected(ApplicationProtocol::Redis)
                .with("version", "7.0.5")
                .with_finding(Finding::new(
                    "unauthenticated-info",
                    Exposure::Vulnerable {
                        evidence: "INFO answered".into(),
                    },
                ))],
        };
        let unknown = PortReport {
            port: 8080,
            transport: Transport::Tcp,
            session: Some(Verdict::detected(SessionProtocol::Plain)),
            presentation: Some(
                Verdict::detected(PresentationProtocol::Http).with("version", "1.1"),
            ),
            applications: Vec::new(),
        };

        let text = plain().render(&[report(vec![6379, 8080], vec![identified, unknown])]).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "192.168.1.5: tcp 6379,8080");
        assert_eq!(lines[1], "  6379/tcp  plain redis  version=7.0.5");
        assert_eq!(lines[2], "    ! unauthenticated-info: INFO answered");
        assert_eq!(lines[3], "  8080/tcp  plain > http/1.1 unknown  version=1.1");
    }

    #[test]
    fn test_json_output() {
        let manager = OutputManager::new(OutputConfig {
            format: OutputFormat::Json,
            ..Default::default()
        });
        let json = manager.render(&[report(vec![22], Vec::new())]).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value[0]["target"]["ip"], "192.168.1.5");
        assert_eq!(value[0]["open_tcp"][0], 22);
        assert_eq!("JSON".parse::<OutputFormat>(), Ok(OutputFormat::Json));
    }
}
