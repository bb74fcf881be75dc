use winnow::ascii::multispace0;
use winnow::combinator::{alt, delimited, eof, opt, peek, preceded, repeat};
use winnow::error::{ContextError, ErrMode, StrContext, StrContextValue};
use winnow::stream::{Location, LocatingSlice};
use winnow::token::{literal, take_until, take_while};
use winnow::{ModalResult, Parser};

type Input<'i> = LocatingSlice<&'i str>;

/// An element as produced by the grammar, carrying the byte offset of its
/// opening `<`. Offsets are converted to line numbers by the caller, which
/// still holds the full source text.
#[derive(Debug)]
pub(crate) struct RawElement {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<RawElement>,
    pub offset: usize,
}

fn make_cut_error(desc: &'static str) -> ErrMode<ContextError<StrContext>> {
    let mut e = ContextError::new();
    e.push(StrContext::Expected(StrContextValue::Description(desc)));
    ErrMode::Cut(e)
}

/// Whitespace consumer (including newlines).
fn ws<'i>(input: &mut Input<'i>) -> ModalResult<&'i str> {
    multispace0.parse_next(input)
}

/// Parse a `<!-- ... -->` comment.
fn comment(input: &mut Input<'_>) -> ModalResult<()> {
    let _ = literal("<!--").parse_next(input)?;
    let _ = take_until(0.., "-->").parse_next(input)?;
    let _ = literal("-->").parse_next(input)?;
    Ok(())
}

/// Skip any mix of whitespace and comments.
fn misc(input: &mut Input<'_>) -> ModalResult<()> {
    loop {
        let _ = ws.parse_next(input)?;
        if opt(comment).parse_next(input)?.is_none() {
            return Ok(());
        }
    }
}

/// Parse an element or attribute name: [A-Za-z_][A-Za-z0-9_.:-]*
fn xml_name<'i>(input: &mut Input<'i>) -> ModalResult<&'i str> {
    (
        take_while(1, |c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(0.., |c: char| {
            c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == ':' || c == '-'
        }),
    )
        .take()
        .parse_next(input)
}

/// Decode the five standard character entities. Any other `&...;` sequence
/// (or a bare `&`) is rejected.
fn decode_entities(raw: &str) -> Result<String, ()> {
    if !raw.contains('&') {
        return Ok(raw.to_string());
    }
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        let end = rest.find(';').ok_or(())?;
        match &rest[..=end] {
            "&amp;" => out.push('&'),
            "&lt;" => out.push('<'),
            "&gt;" => out.push('>'),
            "&quot;" => out.push('"'),
            "&apos;" => out.push('\''),
            _ => return Err(()),
        }
        rest = &rest[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Parse a quoted attribute value (double or single quotes) and decode entities.
fn attr_value(input: &mut Input<'_>) -> ModalResult<String> {
    let raw: &str = alt((
        delimited('"', take_while(0.., |c: char| c != '"'), '"'),
        delimited('\'', take_while(0.., |c: char| c != '\''), '\''),
    ))
    .parse_next(input)?;
    decode_entities(raw).map_err(|_| {
        make_cut_error("known character entity (&amp; &lt; &gt; &quot; &apos;)")
    })
}

/// Parse a single attribute: name '=' quoted-value.
fn attribute(input: &mut Input<'_>) -> ModalResult<(String, String)> {
    let name = xml_name.parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let _ = '='.parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let value = attr_value
        .context(StrContext::Expected(StrContextValue::Description(
            "quoted attribute value",
        )))
        .parse_next(input)?;
    Ok((name.to_string(), value))
}

/// Parse the children of an open element, up to (but not consuming) the
/// closing tag. Non-whitespace text content is rejected.
fn element_body(input: &mut Input<'_>) -> ModalResult<Vec<RawElement>> {
    let mut children = Vec::new();
    loop {
        let text: &str = take_while(0.., |c: char| c != '<').parse_next(input)?;
        if !text.trim().is_empty() {
            return Err(make_cut_error("element content (text content is not allowed)"));
        }
        if peek(opt(literal("</"))).parse_next(input)?.is_some() {
            return Ok(children);
        }
        if opt(comment).parse_next(input)?.is_some() {
            continue;
        }
        let child = element.parse_next(input)?;
        children.push(child);
    }
}

/// Parse one element, self-closing or with a body.
fn element(input: &mut Input<'_>) -> ModalResult<RawElement> {
    let offset = input.current_token_start();
    let _ = '<'.parse_next(input)?;
    let name = xml_name
        .context(StrContext::Expected(StrContextValue::Description(
            "element name",
        )))
        .parse_next(input)?
        .to_string();

    let attributes: Vec<(String, String)> =
        repeat(0.., preceded(ws, attribute)).parse_next(input)?;
    let _ = ws.parse_next(input)?;

    if opt(literal("/>")).parse_next(input)?.is_some() {
        return Ok(RawElement {
            name,
            attributes,
            children: Vec::new(),
            offset,
        });
    }

    let _ = '>'
        .context(StrContext::Expected(StrContextValue::Description(
            "'>' or '/>' to close the tag",
        )))
        .parse_next(input)?;

    let children = element_body.parse_next(input)?;

    let _ = literal("</").parse_next(input)?;
    let close_name = xml_name.parse_next(input)?;
    if close_name != name {
        return Err(make_cut_error("closing tag matching the opening tag"));
    }
    let _ = ws.parse_next(input)?;
    let _ = '>'.parse_next(input)?;

    Ok(RawElement {
        name,
        attributes,
        children,
        offset,
    })
}

/// Top-level parser: optional prolog, comments, one root element, trailing misc.
fn document(input: &mut Input<'_>) -> ModalResult<RawElement> {
    let _ = ws.parse_next(input)?;
    if opt(literal("<?")).parse_next(input)?.is_some() {
        let _ = take_until(0.., "?>").parse_next(input)?;
        let _ = literal("?>").parse_next(input)?;
    }
    let _ = misc.parse_next(input)?;
    let root = element.parse_next(input)?;
    let _ = misc.parse_next(input)?;
    let _ = eof
        .context(StrContext::Expected(StrContextValue::Description(
            "end of document after the root element",
        )))
        .parse_next(input)?;
    Ok(root)
}

/// Run the document grammar. On failure, reports the byte offset the parser
/// stopped at alongside the rendered error.
pub(crate) fn parse_document(text: &str) -> Result<RawElement, (usize, String)> {
    let mut input = LocatingSlice::new(text);
    document
        .parse_next(&mut input)
        .map_err(|e| (input.current_token_start(), format!("{e}")))
}

/// Count lines up to `offset` in `text` (1-based).
pub(crate) fn offset_to_line(text: &str, offset: usize) -> usize {
    text[..offset.min(text.len())].matches('\n').count() + 1
}
