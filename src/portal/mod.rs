mod runner;
mod taxid;

use anyhow::{bail, Result};
use regex::Regex;

use crate::config::{SolverConfig, Strategy};
use crate::document::validity_pattern;
use crate::driver::CaptchaSelectors;

pub use runner::{PortalRunner, RecordOutcome, RunSummary};
pub use taxid::{normalize_document, DocumentKind, TaxId};

/// The challenge standing between the form and the certificate.
#[derive(Debug, Clone, PartialEq)]
pub enum ChallengeKind {
    None,
    Image(CaptchaSelectors),
    /// Token written into `g-recaptcha-response`.
    ReCaptcha,
    /// Token written into `h-captcha-response`.
    HCaptcha,
}

impl ChallengeKind {
    pub fn response_field(&self) -> Option<&'static str> {
        match self {
            ChallengeKind::ReCaptcha => Some("g-recaptcha-response"),
            ChallengeKind::HCaptcha => Some("h-captcha-response"),
            _ => None,
        }
    }
}

/// Where the validity date is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateSource {
    /// A PDF lands in the download directory.
    Download,
    /// The result page itself.
    Page,
}

/// Everything that differs between two certificate portals.
#[derive(Debug, Clone)]
pub struct PortalProfile {
    pub name: &'static str,
    pub title: &'static str,
    pub url: &'static str,
    /// Clicked before the document is typed (radio buttons, tabs).
    pub prepare: Vec<&'static str>,
    pub document_field: &'static str,
    pub documents: &'static [DocumentKind],
    pub challenge: ChallengeKind,
    pub submit: &'static str,
    /// Clicked in order once the form is accepted.
    pub follow_up: Vec<&'static str>,
    pub expected_length: Option<usize>,
    pub strategy: Strategy,
    pub validity_regex: &'static str,
    pub source: CertificateSource,
    pub file_prefix: &'static str,
}

const CNPJ_ONLY: &[DocumentKind] = &[DocumentKind::Cnpj];
const CPF_OR_CNPJ: &[DocumentKind] = &[DocumentKind::Cpf, DocumentKind::Cnpj];

impl PortalProfile {
    pub fn validity_pattern(&self) -> Result<Regex> {
        validity_pattern(self.validity_regex)
    }

    pub fn accepts(&self, id: &TaxId) -> bool {
        self.documents.contains(&id.kind())
    }

    pub fn has_captcha(&self) -> bool {
        self.challenge != ChallengeKind::None
    }

    /// `base` with this portal's answer length and preferred strategy.
    pub fn solver_config(&self, base: &SolverConfig) -> SolverConfig {
        SolverConfig {
            expected_length: self.expected_length,
            strategy: self.strategy,
            ..base.clone()
        }
    }
}

pub fn builtin_profiles() -> Vec<PortalProfile> {
    vec![
        PortalProfile {
            name: "CDT",
            title: "Certidão Negativa de Débitos Trabalhistas (TST)",
            url: "https://cndt-certidao.tst.jus.br/gerarCertidao.faces",
            prepare: vec![],
            document_field: "input[name='formConsultaCertidao:numeroDocumento']",
            documents: CPF_OR_CNPJ,
            // clicking the image renders a new challenge
            challenge: ChallengeKind::Image(
                CaptchaSelectors::new(
                    "img[id='formConsultaCertidao:captchaImg']",
                    "input[name='formConsultaCertidao:captcha']",
                )
                .with_refresh("img[id='formConsultaCertidao:captchaImg']")
                .with_submit("button[id='formConsultaCertidao:btnEmitir']"),
            ),
            submit: "button[id='formConsultaCertidao:btnEmitir']",
            follow_up: vec![],
            expected_length: Some(5),
            strategy: Strategy::Local,
            validity_regex: r"Validade:\s*(\d{2}/\d{2}/\d{4})",
            source: CertificateSource::Download,
            file_prefix: "cdt",
        },
        PortalProfile {
            name: "CRF",
            title: "Certificado de Regularidade do FGTS (Caixa)",
            url: "https://consulta-crf.caixa.gov.br/consultacrf/pages/consultaEmpregador.jsf",
            prepare: vec![],
            document_field: "#mainForm\\:txtInscricao1",
            documents: CNPJ_ONLY,
            challenge: ChallengeKind::Image(
                CaptchaSelectors::new(
                    "img[alt*='captcha' i], img[src*='captcha']",
                    "#mainForm\\:txtCaptcha",
                )
                .with_refresh("img[alt*='captcha' i], img[src*='captcha']")
                .with_submit("#mainForm\\:btnConsultar"),
            ),
            submit: "#mainForm\\:btnConsultar",
            follow_up: vec!["a[href*='certificado' i]", "#mainForm\\:btnVisualizar"],
            expected_length: None,
            strategy: Strategy::Remote,
            validity_regex: r"Validade:\s*\d{2}/\d{2}/\d{4}\s*a\s*(\d{2}/\d{2}/\d{4})",
            source: CertificateSource::Page,
            file_prefix: "crf",
        },
        PortalProfile {
            name: "FALENCIA",
            title: "Certidão de Falência e Concordata (TJAM)",
            url: "https://consultasaj.tjam.jus.br/sco/abrirCadastro.do",
            prepare: vec![],
            document_field: "input[name='nuCpfCnpj']",
            documents: CPF_OR_CNPJ,
            challenge: ChallengeKind::ReCaptcha,
            submit: "input[name='Enviar']",
            follow_up: vec![],
            expected_length: None,
            strategy: Strategy::Remote,
            validity_regex: r"V[áa]lida at[ée]:?\s*(\d{2}/\d{2}/\d{4})",
            source: CertificateSource::Page,
            file_prefix: "falencia",
        },
        PortalProfile {
            name: "MTE",
            title: "Certidão de Débitos Trabalhistas (MTE)",
            url: "https://eprocesso.sit.trabalho.gov.br/Entrar?ReturnUrl=%2FCertidao%2FEmitir",
            prepare: vec!["#janela-login-gov-br a"],
            document_field: "#accountId",
            documents: CPF_OR_CNPJ,
            challenge: ChallengeKind::HCaptcha,
            submit: "button#enter-account-id",
            follow_up: vec![],
            expected_length: None,
            strategy: Strategy::Remote,
            validity_regex: r"Válida até:\s*(\d{2}/\d{2}/\d{4})",
            source: CertificateSource::Download,
            file_prefix: "mte",
        },
        PortalProfile {
            name: "PMM",
            title: "Certidão Negativa Municipal (Prefeitura de Manaus)",
            url: "https://semefatende.manaus.am.gov.br/servicoJanela.php?servico=1412",
            prepare: vec!["#VTIPOFILTRO3"],
            document_field: "#vNRFILTRO",
            documents: CNPJ_ONLY,
            challenge: ChallengeKind::Image(
                CaptchaSelectors::new("img[src*='/Captcha/images/']", "#_cfield")
                    .with_submit("input[name='BTNCONSULTAR']"),
            ),
            submit: "input[name='BTNCONSULTAR']",
            follow_up: vec![],
            expected_length: Some(5),
            strategy: Strategy::Hybrid,
            validity_regex: r"VÁLIDA ATÉ \s*(\d{2}/\d{2}/\d{4})",
            source: CertificateSource::Download,
            file_prefix: "pmm",
        },
        PortalProfile {
            name: "RFB",
            title: "Certidão de Débitos Relativos a Tributos Federais (Receita Federal)",
            url: "https://servicos.receitafederal.gov.br/servico/certidoes/#/home/cnpj",
            prepare: vec![],
            document_field: "input[name='niContribuinte']",
            documents: CNPJ_ONLY,
            challenge: ChallengeKind::None,
            submit: "button.nova-certidao",
            follow_up: vec![],
            expected_length: None,
            strategy: Strategy::Local,
            validity_regex: r"Válida até (\d{2}/\d{2}/\d{4})",
            source: CertificateSource::Download,
            file_prefix: "rfb",
        },
        PortalProfile {
            name: "SEFAZ",
            title: "Certidão Negativa de Débitos Estaduais (SEFAZ-AM)",
            url: "https://sistemas.sefaz.am.gov.br/GAE/mnt/dividaAtiva/certidaoNegativa/emitirCertidaoNegativaNaoContPortal.do",
            prepare: vec![],
            document_field: "input[name='cpfCnpj']",
            documents: CPF_OR_CNPJ,
            challenge: ChallengeKind::None,
            submit: "input[value='Emitir'], button[name='emitir']",
            follow_up: vec![],
            expected_length: None,
            strategy: Strategy::Local,
            validity_regex: r"Válida até:\s*(\d{2}/\d{2}/\d{4})",
            source: CertificateSource::Page,
            file_prefix: "sefaz_n_contribuinte",
        },
    ]
}

/// Look a built-in profile up by name, ignoring case.
pub fn find_profile(name: &str) -> Result<PortalProfile> {
    let wanted = name.trim();
    match builtin_profiles()
        .into_iter()
        .find(|p| p.name.eq_ignore_ascii_case(wanted))
    {
        Some(profile) => Ok(profile),
        None => {
            let known: Vec<&str> = builtin_profiles().iter().map(|p| p.name).collect();
            bail!("Unknown portal '{}' (known: {})", wanted, known.join(", "))
        }
    }
}
