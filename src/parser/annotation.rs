//! Type annotations: bare names, dotted dtype names, `int | float` unions and
//! string annotations such as `'const float[:,:](order=F)'`.

use super::{AnnotatedType, Annotation, ArrayOrder, BinaryOp, Expr, ExprKind};

pub(crate) fn annotation_from_expr(expr: &Expr) -> Result<Annotation, String> {
    let mut alternatives = Vec::new();
    collect_alternatives(expr, &mut alternatives)?;
    Ok(Annotation {
        alternatives,
        span: expr.span,
    })
}

fn collect_alternatives(expr: &Expr, out: &mut Vec<AnnotatedType>) -> Result<(), String> {
    match &expr.kind {
        ExprKind::Name(name) => out.push(scalar(name)),
        ExprKind::Attribute { attr, .. } => out.push(scalar(attr)),
        ExprKind::None => out.push(scalar("void")),
        ExprKind::Str(text) => out.extend(parse_annotation_text(text)?),
        ExprKind::Binary { left, op: BinaryOp::BitOr, right } => {
            collect_alternatives(left, out)?;
            collect_alternatives(right, out)?;
        }
        _ => return Err("expected a type name or a string annotation".to_string()),
    }
    Ok(())
}

fn scalar(dtype: &str) -> AnnotatedType {
    AnnotatedType {
        dtype: dtype.to_string(),
        rank: 0,
        order: None,
        is_const: false,
    }
}

/// Parse the text of a string annotation into its alternatives.
pub fn parse_annotation_text(text: &str) -> Result<Vec<AnnotatedType>, String> {
    text.split('|').map(|part| parse_single(part.trim())).collect()
}

fn parse_single(text: &str) -> Result<AnnotatedType, String> {
    let mut rest = text;
    let mut is_const = false;
    if let Some(stripped) = rest.strip_prefix("const ") {
        is_const = true;
        rest = stripped.trim_start();
    }

    let name_len = rest
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '.'))
        .unwrap_or(rest.len());
    if name_len == 0 {
        return Err(format!("missing type name in '{}'", text));
    }
    let dotted = &rest[..name_len];
    let dtype = dotted.rsplit('.').next().unwrap_or(dotted).to_string();
    rest = rest[name_len..].trim_start();

    let mut rank = 0;
    if let Some(after) = rest.strip_prefix('[') {
        let close = after.find(']').ok_or_else(|| format!("missing ']' in '{}'", text))?;
        let dims = &after[..close];
        for dim in dims.split(',') {
            if dim.trim() != ":" {
                return Err(format!("array dimensions must be written ':' in '{}'", text));
            }
            rank += 1;
        }
        rest = after[close + 1..].trim_start();
    }

    let mut order = None;
    if let Some(after) = rest.strip_prefix('(') {
        let close = after.find(')').ok_or_else(|| format!("missing ')' in '{}'", text))?;
        let (key, value) = after[..close]
            .split_once('=')
            .ok_or_else(|| format!("expected 'order=C' or 'order=F' in '{}'", text))?;
        if key.trim() != "order" {
            return Err(format!("unknown annotation option '{}'", key.trim()));
        }
        order = match value.trim() {
            "C" => Some(ArrayOrder::C),
            "F" => Some(ArrayOrder::F),
            other => return Err(format!("unknown array order '{}'", other)),
        };
        if rank == 0 {
            return Err(format!("order given for a scalar in '{}'", text));
        }
        rest = after[close + 1..].trim_start();
    }

    if !rest.is_empty() {
        return Err(format!("unexpected '{}' in annotation", rest));
    }

    Ok(AnnotatedType {
        dtype,
        rank,
        order,
        is_const,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_annotations() {
        let parsed = parse_annotation_text("int[:,:](order=F)").unwrap();
        assert_eq!(parsed[0].dtype, "int");
        assert_eq!(parsed[0].rank, 2);
        assert_eq!(parsed[0].order, Some(ArrayOrder::F));

        let parsed = parse_annotation_text("const float64[:]").unwrap();
        assert!(parsed[0].is_const);
        assert_eq!(parsed[0].rank, 1);
    }

    #[test]
    fn unions_give_alternatives() {
        let parsed = parse_annotation_text("int | float[:]").unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1].rank, 1);
    }

    #[test]
    fn malformed_annotations_are_rejected() {
        assert!(parse_annotation_text("float[3]").is_err());
        assert!(parse_annotation_text("int(order=F)").is_err());
        assert!(parse_annotation_text("[:]").is_err());
        assert!(parse_annotation_text("float[:](order=X)").is_err());
    }
}
