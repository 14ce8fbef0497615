use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    Stdout,
    Disabled,
}

impl LogOutput {
    pub fn parse(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("none") { Self::Disabled } else { Self::Stdout }
    }
}

pub fn span_events(enabled: bool) -> FmtSpan {
    if enabled { FmtSpan::NEW | FmtSpan::CLOSE } else { FmtSpan::NONE }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anything_but_none_logs_to_stdout() {
        assert_eq!(LogOutput::parse(""), LogOutput::Stdout);
        assert_eq!(LogOutput::parse("stdout"), LogOutput::Stdout);
        assert_eq!(LogOutput::parse(" NONE "), LogOutput::Disabled);
    }
}
