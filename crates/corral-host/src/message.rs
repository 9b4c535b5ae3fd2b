//! Classification of slave-mode protocol messages.
//!
//! One decoded frame can carry several logical messages back to back. The
//! single [`classify`] function inspects the head of the residual text and
//! produces a [`MessageKind`] plus the number of bytes it consumed; the
//! session then matches on the variant. The checks run in a fixed priority
//! order: data request, data delivery, completion, peer error, parameter
//! get, parameter set, and finally the command-line forms.

/// One classified protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    /// `xfer(chan,nbytes)` — the peer asks to be fed input.
    DataRequest {
        /// Protocol channel to feed.
        channel: i32,
        /// Number of payload bytes requested.
        nbytes: usize,
    },
    /// `xmit(chan,nbytes)` — the peer announces a data delivery.
    DataDelivery {
        /// Protocol channel carrying the data.
        channel: i32,
        /// Number of characters in the following frame.
        nbytes: usize,
    },
    /// `bye` — the task finished normally.
    Done,
    /// `error…`/`ERROR…` — the task failed and says why.
    PeerError {
        /// Numeric code scanned from an `error(<code>, "text")` form.
        errno: Option<i32>,
        /// The error text.
        text: String,
    },
    /// `=name` — the peer wants a parameter value.
    ParamGet {
        /// The requested parameter, possibly qualified and subscripted.
        name: String,
    },
    /// `name = value` — the peer stores a parameter value.
    ParamSet {
        /// The parameter being written.
        name: String,
        /// The new value, verbatim up to the newline.
        value: String,
    },
    /// `_curpack` — the peer asks for the active task group's name.
    GroupQuery,
    /// `!!cmd` — the peer asks for a host shell command.
    OsEscape {
        /// The shell command to run.
        command: String,
    },
    /// Anything else: a command line for the interpreter.
    Command {
        /// The full line, newline included when one was present.
        line: String,
    },
}

/// A classified message plus how much of the residual text it consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    /// What the message is.
    pub kind: MessageKind,
    /// Bytes of residual text this message accounted for.
    pub consumed: usize,
}

/// A message head that matched a structured form but failed to parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedMessage {
    /// The text that could not be parsed.
    pub fragment: String,
}

const DATA_REQUEST_PREFIX: &str = "xfer(";
const DATA_DELIVERY_PREFIX: &str = "xmit(";
const COMPLETION: &str = "bye\n";
const GROUP_QUERY: &str = "_curpack";
const OS_ESCAPE_PREFIX: &str = "!!";

/// Classifies the head of the residual message text.
///
/// # Errors
///
/// Returns [`MalformedMessage`] when a `xfer(`/`xmit(` head does not parse
/// as `(<channel>,<nbytes>)` terminating the message. Transfer commands are
/// always the last thing in a frame because binary data follows; trailing
/// text after one is a protocol violation, not a second message.
pub fn classify(message: &str) -> Result<Classified, MalformedMessage> {
    if message.starts_with(DATA_REQUEST_PREFIX) {
        let (channel, nbytes) = parse_transfer(message)?;
        return Ok(Classified {
            kind: MessageKind::DataRequest { channel, nbytes },
            consumed: message.len(),
        });
    }

    if message.starts_with(DATA_DELIVERY_PREFIX) {
        let (channel, nbytes) = parse_transfer(message)?;
        return Ok(Classified {
            kind: MessageKind::DataDelivery { channel, nbytes },
            consumed: message.len(),
        });
    }

    if message.starts_with(COMPLETION) {
        return Ok(Classified {
            kind: MessageKind::Done,
            consumed: COMPLETION.len(),
        });
    }

    if message.starts_with("error") || message.starts_with("ERROR") {
        let (errno, text) = scan_errno(message);
        return Ok(Classified {
            kind: MessageKind::PeerError { errno, text },
            consumed: message.len(),
        });
    }

    if let Some((name, consumed)) = match_param_get(message) {
        return Ok(Classified {
            kind: MessageKind::ParamGet { name },
            consumed,
        });
    }

    if let Some((name, value, consumed)) = match_param_set(message) {
        return Ok(Classified {
            kind: MessageKind::ParamSet { name, value },
            consumed,
        });
    }

    Ok(classify_command(message))
}

/// Parses `xfer(chan,nbytes)\n` / `xmit(chan,nbytes)\n` heads.
fn parse_transfer(message: &str) -> Result<(i32, usize), MalformedMessage> {
    let malformed = || MalformedMessage {
        fragment: message.to_owned(),
    };
    let body = message
        .get(DATA_DELIVERY_PREFIX.len()..)
        .and_then(|rest| rest.strip_suffix(")\n"))
        .ok_or_else(malformed)?;
    let (channel_text, nbytes_text) = body.split_once(',').ok_or_else(malformed)?;
    let channel = channel_text.trim().parse().map_err(|_| malformed())?;
    let nbytes = nbytes_text.trim().parse().map_err(|_| malformed())?;
    Ok((channel, nbytes))
}

/// Scans a peer error message for the `error(<code>, "text")` form.
///
/// Messages that do not carry the structured form keep their full text and
/// no code.
fn scan_errno(message: &str) -> (Option<i32>, String) {
    let fallback = || (None, message.trim_end().to_owned());
    let Some(open) = message.find('(') else {
        return fallback();
    };
    let Some(rest) = message.get(open + 1..) else {
        return fallback();
    };
    let Some((code_text, tail)) = rest.split_once(',') else {
        return fallback();
    };
    let Ok(errno) = code_text.trim().parse::<i32>() else {
        return fallback();
    };
    let Some(quoted) = tail.trim_start().strip_prefix('"') else {
        return fallback();
    };
    let Some(close) = quoted.find('"') else {
        return fallback();
    };
    match quoted.get(..close) {
        Some(text) => (Some(errno), text.to_owned()),
        None => fallback(),
    }
}

fn is_blank(byte: u8) -> bool {
    byte == b' ' || byte == b'\t'
}

fn skip_blanks(bytes: &[u8], mut index: usize) -> usize {
    while bytes.get(index).copied().is_some_and(is_blank) {
        index += 1;
    }
    index
}

/// Matches a parameter name starting at `start`.
///
/// Names begin with a letter, underscore, or (for get requests) a dollar
/// sign, continue with word characters and dots, and may end with a numeric
/// subscript like `[3]`.
fn match_name(message: &str, start: usize, allow_dollar: bool) -> Option<(String, usize)> {
    let bytes = message.as_bytes();
    let first = *bytes.get(start)?;
    let first_ok = first.is_ascii_alphabetic() || first == b'_' || (allow_dollar && first == b'$');
    if !first_ok {
        return None;
    }
    let mut end = start + 1;
    while bytes
        .get(end)
        .is_some_and(|&b| b.is_ascii_alphanumeric() || b == b'_' || b == b'.')
    {
        end += 1;
    }
    if bytes.get(end) == Some(&b'[') {
        let digits_start = end + 1;
        let mut digits_end = digits_start;
        while bytes.get(digits_end).is_some_and(u8::is_ascii_digit) {
            digits_end += 1;
        }
        if digits_end > digits_start && bytes.get(digits_end) == Some(&b']') {
            end = digits_end + 1;
        }
    }
    message.get(start..end).map(|name| (name.to_owned(), end))
}

/// Matches `=name\n` parameter-get requests, blanks tolerated throughout.
fn match_param_get(message: &str) -> Option<(String, usize)> {
    let bytes = message.as_bytes();
    let mut index = skip_blanks(bytes, 0);
    if bytes.get(index) != Some(&b'=') {
        return None;
    }
    index = skip_blanks(bytes, index + 1);
    let (name, after_name) = match_name(message, index, true)?;
    index = skip_blanks(bytes, after_name);
    if bytes.get(index) == Some(&b'\n') {
        Some((name, index + 1))
    } else {
        None
    }
}

/// Matches `name = value\n` parameter-set notifications.
fn match_param_set(message: &str) -> Option<(String, String, usize)> {
    let bytes = message.as_bytes();
    let (name, after_name) = match_name(message, 0, false)?;
    let mut index = skip_blanks(bytes, after_name);
    if bytes.get(index) != Some(&b'=') {
        return None;
    }
    index = skip_blanks(bytes, index + 1);
    let newline = message.get(index..)?.find('\n')? + index;
    let value = message.get(index..newline)?.to_owned();
    Some((name, value, newline + 1))
}

/// Classifies the command-line forms: group query, OS escape, or a plain
/// interpreter command. Never fails; an unterminated tail is handed to the
/// interpreter whole.
fn classify_command(message: &str) -> Classified {
    let (line, consumed) = match message.find('\n') {
        Some(position) => (&message[..position], position + 1),
        None => (message, message.len()),
    };
    let terminated = consumed > line.len();

    if terminated {
        if let Some(rest) = line.strip_prefix(GROUP_QUERY) {
            if rest.is_empty() || rest.starts_with(' ') || rest.starts_with('\t') {
                return Classified {
                    kind: MessageKind::GroupQuery,
                    consumed,
                };
            }
        }
        if let Some(command) = line.strip_prefix(OS_ESCAPE_PREFIX) {
            return Classified {
                kind: MessageKind::OsEscape {
                    command: command.to_owned(),
                },
                consumed,
            };
        }
    }

    Classified {
        kind: MessageKind::Command {
            line: message[..consumed].to_owned(),
        },
        consumed,
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn kind_of(message: &str) -> MessageKind {
        match classify(message) {
            Ok(classified) => classified.kind,
            Err(err) => panic!("unexpected classification failure: {err:?}"),
        }
    }

    #[rstest]
    fn classifies_data_request() {
        assert_eq!(
            kind_of("xfer(3,4095)\n"),
            MessageKind::DataRequest {
                channel: 3,
                nbytes: 4095
            }
        );
    }

    #[rstest]
    fn classifies_data_delivery() {
        assert_eq!(
            kind_of("xmit(4,5)\n"),
            MessageKind::DataDelivery {
                channel: 4,
                nbytes: 5
            }
        );
    }

    #[rstest]
    #[case::trailing_text("xmit(4,5)\nbye\n")]
    #[case::missing_newline("xmit(4,5)")]
    #[case::no_comma("xmit(45)\n")]
    #[case::not_a_number("xmit(4,five)\n")]
    fn rejects_malformed_transfers(#[case] message: &str) {
        assert!(classify(message).is_err());
    }

    #[rstest]
    fn classifies_completion_and_leaves_residual() {
        let Ok(classified) = classify("bye\nleftover") else {
            panic!("bye should classify");
        };
        assert_eq!(classified.kind, MessageKind::Done);
        assert_eq!(classified.consumed, 4);
    }

    #[rstest]
    #[case::structured("error (741, \"cannot open image\")\n", Some(741), "cannot open image")]
    #[case::upper("ERROR: out of memory\n", None, "ERROR: out of memory")]
    #[case::unparsed_code("error (x, \"odd\")\n", None, "error (x, \"odd\")")]
    fn classifies_peer_errors(
        #[case] message: &str,
        #[case] errno: Option<i32>,
        #[case] text: &str,
    ) {
        assert_eq!(
            kind_of(message),
            MessageKind::PeerError {
                errno,
                text: text.to_owned()
            }
        );
    }

    #[rstest]
    #[case::simple("=exposure\n", "exposure")]
    #[case::blanks("  =  exposure  \n", "exposure")]
    #[case::qualified("=imstat.images\n", "imstat.images")]
    #[case::cl_variable("=$nargs\n", "$nargs")]
    #[case::subscripted("=region[2]\n", "region[2]")]
    fn classifies_param_get(#[case] message: &str, #[case] name: &str) {
        assert_eq!(
            kind_of(message),
            MessageKind::ParamGet {
                name: name.to_owned()
            }
        );
    }

    #[rstest]
    fn classifies_param_set() {
        assert_eq!(
            kind_of("exposure = 120\n"),
            MessageKind::ParamSet {
                name: "exposure".to_owned(),
                value: "120".to_owned()
            }
        );
    }

    #[rstest]
    fn param_set_keeps_value_verbatim() {
        assert_eq!(
            kind_of("title=  a b c \n"),
            MessageKind::ParamSet {
                name: "title".to_owned(),
                value: "a b c ".to_owned()
            }
        );
    }

    #[rstest]
    #[case::bare("_curpack\n")]
    #[case::with_argument("_curpack anything\n")]
    fn classifies_group_query(#[case] message: &str) {
        assert_eq!(kind_of(message), MessageKind::GroupQuery);
    }

    #[rstest]
    fn group_query_prefix_without_break_is_a_command() {
        assert_eq!(
            kind_of("_curpackage\n"),
            MessageKind::Command {
                line: "_curpackage\n".to_owned()
            }
        );
    }

    #[rstest]
    fn classifies_os_escape() {
        assert_eq!(
            kind_of("!!ls -l\n"),
            MessageKind::OsEscape {
                command: "ls -l".to_owned()
            }
        );
    }

    #[rstest]
    fn command_lines_fall_through_with_newline() {
        let Ok(classified) = classify("print \"a=b\"\n=next\n") else {
            panic!("command should classify");
        };
        assert_eq!(
            classified.kind,
            MessageKind::Command {
                line: "print \"a=b\"\n".to_owned()
            }
        );
        assert_eq!(classified.consumed, 12);
    }

    #[rstest]
    fn stacked_messages_classify_one_at_a_time() {
        let message = "exposure = 120\n=gain\n";
        let Ok(first) = classify(message) else {
            panic!("first message should classify");
        };
        assert_eq!(first.consumed, 15);
        let Ok(second) = classify(&message[first.consumed..]) else {
            panic!("second message should classify");
        };
        assert_eq!(
            second.kind,
            MessageKind::ParamGet {
                name: "gain".to_owned()
            }
        );
    }
}
