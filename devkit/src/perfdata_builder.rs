/*!
Builders de lignes et fichiers perfdata

Produit le format écrit par Nagios dans le spool (`KEY::VALUE` séparés par
des tabulations), pour alimenter le parser et le harness.
*/

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Epoch par défaut des lignes générées (2016-11-21T11:11:00+00:00)
pub const DEFAULT_TIMET: &str = "1479726660";

/// Une ligne HOSTPERFDATA ou SERVICEPERFDATA
#[derive(Debug, Clone)]
pub struct PerfdataLine {
    host: String,
    service: Option<String>,
    timet: String,
    perfdata: Vec<String>,
}

impl PerfdataLine {
    pub fn service(host: &str, service: &str) -> Self {
        Self {
            host: host.to_string(),
            service: Some(service.to_string()),
            timet: DEFAULT_TIMET.to_string(),
            perfdata: Vec::new(),
        }
    }

    pub fn host(host: &str) -> Self {
        Self {
            host: host.to_string(),
            service: None,
            timet: DEFAULT_TIMET.to_string(),
            perfdata: Vec::new(),
        }
    }

    pub fn at(mut self, timet: &str) -> Self {
        self.timet = timet.to_string();
        self
    }

    /// Ajoute `name=value;;;;` (seuils vides, comme la plupart des plugins)
    pub fn metric(mut self, name: &str, value: &str) -> Self {
        self.perfdata.push(format!("{}={};;;;", name, value));
        self
    }

    /// Token perfdata brut, sans retouche
    pub fn raw(mut self, token: &str) -> Self {
        self.perfdata.push(token.to_string());
        self
    }

    pub fn build(&self) -> String {
        let perfdata = self.perfdata.join(" ");
        match &self.service {
            Some(service) => format!(
                "DATATYPE::SERVICEPERFDATA\tTIMET::{}\tHOSTNAME::{}\tSERVICEDESC::{}\tSERVICEPERFDATA::{}\tSERVICECHECKCOMMAND::check-mk\tSERVICESTATE::OK",
                self.timet, self.host, service, perfdata
            ),
            None => format!(
                "DATATYPE::HOSTPERFDATA\tTIMET::{}\tHOSTNAME::{}\tHOSTPERFDATA::{}\tHOSTCHECKCOMMAND::check-host-alive\tHOSTSTATE::UP",
                self.timet, self.host, perfdata
            ),
        }
    }
}

/// Contenu d'un fichier du spool
#[derive(Debug, Clone, Default)]
pub struct SpoolFile {
    lines: Vec<String>,
}

impl SpoolFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn line(mut self, line: PerfdataLine) -> Self {
        self.lines.push(line.build());
        self
    }

    /// Ligne quelconque (vide, corrompue...)
    pub fn text(mut self, text: &str) -> Self {
        self.lines.push(text.to_string());
        self
    }

    pub fn content(&self) -> String {
        let mut content = self.lines.join("\n");
        content.push('\n');
        content
    }

    pub fn write(&self, dir: &Path, name: &str) -> Result<PathBuf> {
        let path = dir.join(name);
        std::fs::write(&path, self.content())
            .with_context(|| format!("failed to write spool file {}", path.display()))?;
        Ok(path)
    }
}
