//! Gemini response framing and gemtext document building.

/// Gemini status codes used by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    RedirectPermanent,
    SlowDown,
    NotFound,
    BadRequest,
}

impl Status {
    pub fn code(self) -> u8 {
        match self {
            Status::Success => 20,
            Status::RedirectPermanent => 31,
            Status::SlowDown => 44,
            Status::NotFound => 51,
            Status::BadRequest => 59,
        }
    }
}

/// `<status> <meta>\r\n[<body>]`
pub fn response(status: Status, meta: &str, body: Option<&str>) -> Vec<u8> {
    let meta: String = meta
        .chars()
        .map(|c| if c == '\r' || c == '\n' { ' ' } else { c })
        .collect();
    let mut out = format!("{} {}\r\n", status.code(), meta).into_bytes();
    if let Some(body) = body {
        out.extend_from_slice(body.as_bytes());
    }
    out
}

/// Successful gemtext response.
pub fn success(body: &str) -> Vec<u8> {
    response(Status::Success, "text/gemini; charset=utf-8", Some(body))
}

/// Incremental gemtext document builder.
#[derive(Debug, Clone, Default)]
pub struct Gemtext {
    out: String,
}

impl Gemtext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn heading(&mut self, level: u8, text: &str) -> &mut Self {
        let hashes = "#".repeat(usize::from(level.clamp(1, 3)));
        self.out.push_str(&format!("{hashes} {text}\n"));
        self
    }

    pub fn line(&mut self, text: &str) -> &mut Self {
        // A body line starting with "```" would toggle preformatting.
        if text.starts_with("```") {
            self.out.push(' ');
        }
        self.out.push_str(text);
        self.out.push('\n');
        self
    }

    pub fn blank(&mut self) -> &mut Self {
        self.out.push('\n');
        self
    }

    pub fn link(&mut self, url: &str, label: &str) -> &mut Self {
        if label.is_empty() {
            self.out.push_str(&format!("=> {url}\n"));
        } else {
            self.out.push_str(&format!("=> {url} {label}\n"));
        }
        self
    }

    /// Append an already-rendered gemtext fragment.
    pub fn raw(&mut self, fragment: &str) -> &mut Self {
        self.out.push_str(fragment);
        if !fragment.ends_with('\n') {
            self.out.push('\n');
        }
        self
    }

    pub fn finish(&self) -> String {
        self.out.clone()
    }
}
