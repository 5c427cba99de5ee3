//! Gophermap construction (RFC 1436).
//!
//! Every menu line is `<type><display>\t<selector>\t<host>\t<port>\r\n`
//! and a menu terminates with `.\r\n`. Info lines use the conventional
//! fake selector/host/port so clients render them as text.

/// Gopher item types used by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemType {
    /// `0` plain text file
    Text,
    /// `1` submenu
    Menu,
    /// `3` error
    Error,
    /// `i` informational line
    Info,
    /// `h` html/url link
    Html,
}

impl ItemType {
    fn code(self) -> char {
        match self {
            ItemType::Text => '0',
            ItemType::Menu => '1',
            ItemType::Error => '3',
            ItemType::Info => 'i',
            ItemType::Html => 'h',
        }
    }
}

/// Incremental gophermap builder.
#[derive(Debug, Clone)]
pub struct Gophermap {
    host: String,
    port: u16,
    lines: Vec<String>,
}

fn sanitize(field: &str) -> String {
    field
        .chars()
        .map(|c| match c {
            '\t' => ' ',
            '\r' | '\n' => ' ',
            c => c,
        })
        .collect()
}

impl Gophermap {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            lines: Vec::new(),
        }
    }

    pub fn item(
        &mut self,
        item_type: ItemType,
        display: &str,
        selector: &str,
    ) -> &mut Self {
        self.lines.push(format!(
            "{}{}\t{}\t{}\t{}",
            item_type.code(),
            sanitize(display),
            sanitize(selector),
            self.host,
            self.port,
        ));
        self
    }

    /// Informational text line.
    pub fn info(&mut self, display: &str) -> &mut Self {
        self.lines
            .push(format!("i{}\tfake\tnull.host\t0", sanitize(display)));
        self
    }

    /// A run of informational lines.
    pub fn info_block(&mut self, text: &str) -> &mut Self {
        for line in text.lines() {
            self.info(line);
        }
        self
    }

    /// Blank separator line.
    pub fn blank(&mut self) -> &mut Self {
        self.info("")
    }

    /// Link to a submenu.
    pub fn menu(&mut self, display: &str, selector: &str) -> &mut Self {
        self.item(ItemType::Menu, display, selector)
    }

    /// Link to a text document.
    pub fn text(&mut self, display: &str, selector: &str) -> &mut Self {
        self.item(ItemType::Text, display, selector)
    }

    /// Error line.
    pub fn error(&mut self, display: &str) -> &mut Self {
        self.lines
            .push(format!("3{}\tfake\tnull.host\t0", sanitize(display)));
        self
    }

    /// External URL link.
    pub fn url(&mut self, display: &str, url: &str) -> &mut Self {
        self.item(ItemType::Html, display, &format!("URL:{url}"))
    }

    /// Serialize with CRLF line endings and the terminating `.` line.
    pub fn finish(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            out.push_str(line);
            out.push_str("\r\n");
        }
        out.push_str(".\r\n");
        out
    }
}

/// Serve a plain text document over gopher: body then `.\r\n`.
pub fn text_document(body: &str) -> String {
    let mut out = String::new();
    for line in body.lines() {
        // A lone "." terminates the transaction early; escape per RFC.
        if line == "." {
            out.push_str("..");
        } else {
            out.push_str(line);
        }
        out.push_str("\r\n");
    }
    out.push_str(".\r\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_valid_gophermap(response: &str) {
        assert!(response.ends_with(".\r\n"));
        for line in response.split("\r\n") {
            if line.is_empty() || line == "." {
                continue;
            }
            let fields: Vec<&str> = line.split('\t').collect();
            assert_eq!(fields.len(), 4, "line {line:?} must have four fields");
            assert!(fields[3].parse::<u16>().is_ok(), "port must parse: {line:?}");
        }
    }

    #[test]
    fn menu_lines_have_four_fields_and_terminator() {
        let mut map = Gophermap::new("example.org", 70);
        map.info("welcome")
            .blank()
            .menu("Notes", "/notes")
            .text("A note", "/event/abc")
            .url("Website", "https://example.org")
            .error("nope");
        assert_valid_gophermap(&map.finish());
    }

    #[test]
    fn tabs_and_newlines_are_sanitized() {
        let mut map = Gophermap::new("example.org", 70);
        map.menu("evil\tdisplay\r\nname", "/se\tlector");
        let response = map.finish();
        assert_valid_gophermap(&response);
        assert!(response.contains("1evil display  name"));
    }

    #[test]
    fn text_documents_escape_lone_dots() {
        let doc = text_document("line one\n.\nline two");
        assert!(doc.contains("\r\n..\r\n"));
        assert!(doc.ends_with(".\r\n"));
    }
}
