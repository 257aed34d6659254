use sqlparser::ast as sq;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

use super::ast::{Node, OrderByItem, QueryAst, SelectItem};
use super::errors::QueryAstError;

/// Parse one SELECT or DELETE statement into the query tree consumed by the rewriter.
///
/// Compound select fields come out as the `base`, `.`, `sub` triple, with any alias on `sub`.
pub fn parse_sql(sql: &str) -> Result<QueryAst, QueryAstError> {
    let dialect = GenericDialect {};
    let statements = Parser::parse_sql(&dialect, sql).map_err(|e| QueryAstError::Parse(e.to_string()))?;
    if statements.len() != 1 {
        return Err(QueryAstError::Unsupported("multi-statement"));
    }
    match &statements[0] {
        sq::Statement::Query(q) => convert_query(q),
        sq::Statement::Delete(d) => convert_delete(d),
        _ => Err(QueryAstError::Unsupported("only SELECT and DELETE are supported")),
    }
}

fn convert_query(q: &sq::Query) -> Result<QueryAst, QueryAstError> {
    let sq::SetExpr::Select(sel) = q.body.as_ref() else {
        return Err(QueryAstError::Unsupported("unsupported set expr"));
    };
    let mut query = QueryAst::new(single_table(&sel.from)?);

    for item in &sel.projection {
        match item {
            sq::SelectItem::Wildcard(_) => query.select.push(SelectItem::wildcard()),
            sq::SelectItem::UnnamedExpr(e) => push_select(&mut query.select, e, None)?,
            sq::SelectItem::ExprWithAlias { expr, alias } => {
                push_select(&mut query.select, expr, Some(alias.value.clone()))?
            }
            _ => return Err(QueryAstError::Unsupported("qualified wildcard")),
        }
    }

    query.r#where = sel.selection.as_ref().map(convert_expr);

    if let sq::GroupByExpr::Expressions(exprs, _) = &sel.group_by {
        query.group = exprs.iter().map(convert_expr).collect();
    }
    if sel.having.is_some() {
        return Err(QueryAstError::Unsupported("HAVING"));
    }

    if let Some(ob) = &q.order_by {
        query.order_by = ob
            .exprs
            .iter()
            .map(|o| OrderByItem { node: convert_expr(&o.expr), asc: o.asc.unwrap_or(true) })
            .collect();
    }
    query.limit = parse_limit(q.limit.as_ref())?;
    Ok(query)
}

fn convert_delete(d: &sq::Delete) -> Result<QueryAst, QueryAstError> {
    let tables = match &d.from {
        sq::FromTable::WithFromKeyword(t) | sq::FromTable::WithoutKeyword(t) => t,
    };
    let mut query = QueryAst::new(single_table(tables)?);
    query.delete = true;
    query.r#where = d.selection.as_ref().map(convert_expr);
    query.limit = parse_limit(d.limit.as_ref())?;
    Ok(query)
}

fn single_table(from: &[sq::TableWithJoins]) -> Result<String, QueryAstError> {
    let [table] = from else {
        return Err(QueryAstError::Unsupported("exactly one FROM index is required"));
    };
    if !table.joins.is_empty() {
        return Err(QueryAstError::Unsupported("joins"));
    }
    match &table.relation {
        sq::TableFactor::Table { name, .. } => Ok(name.0.iter().map(|i| i.value.as_str()).collect::<Vec<_>>().join(".")),
        _ => Err(QueryAstError::Unsupported("complex table ref")),
    }
}

fn parse_limit(limit: Option<&sq::Expr>) -> Result<Option<u64>, QueryAstError> {
    match limit {
        None => Ok(None),
        Some(sq::Expr::Value(sq::Value::Number(n, _))) => {
            n.parse().map(Some).map_err(|_| QueryAstError::Parse(format!("invalid LIMIT {}", n)))
        }
        Some(_) => Err(QueryAstError::Unsupported("non-numeric LIMIT")),
    }
}

fn push_select(out: &mut Vec<SelectItem>, e: &sq::Expr, alias: Option<String>) -> Result<(), QueryAstError> {
    let item = match e {
        sq::Expr::Identifier(id) => SelectItem::literal(id.value.clone()),
        sq::Expr::CompoundIdentifier(parts) if parts.len() > 1 => {
            let (sub, base) = parts.split_last().ok_or(QueryAstError::Unsupported("empty identifier"))?;
            out.push(SelectItem::literal(base.iter().map(|p| p.value.as_str()).collect::<Vec<_>>().join(".")));
            out.push(SelectItem::dot());
            SelectItem::literal(sub.value.clone())
        }
        sq::Expr::Function(f) => match convert_expr(e) {
            Node::Function { name, arguments } => SelectItem::function(name, arguments),
            _ => return Err(QueryAstError::Unsupported(unsupported_function(f))),
        },
        _ => SelectItem::literal(e.to_string()),
    };
    out.push(match alias {
        Some(a) => item.with_alias(a),
        None => item,
    });
    Ok(())
}

fn unsupported_function(f: &sq::Function) -> &'static str {
    match f.args {
        sq::FunctionArguments::Subquery(_) => "subquery function argument",
        _ => "function arguments",
    }
}

fn convert_expr(e: &sq::Expr) -> Node {
    match e {
        sq::Expr::Identifier(id) => Node::Literal(id.value.clone()),
        sq::Expr::CompoundIdentifier(parts) => {
            Node::Literal(parts.iter().map(|p| p.value.as_str()).collect::<Vec<_>>().join("."))
        }
        sq::Expr::Value(v) => convert_value(v),
        sq::Expr::BinaryOp { left, op, right } => match op {
            sq::BinaryOperator::And => Node::and(convert_expr(left), convert_expr(right)),
            sq::BinaryOperator::Or => Node::or(convert_expr(left), convert_expr(right)),
            _ => Node::operator(op.to_string(), convert_expr(left), convert_expr(right)),
        },
        sq::Expr::UnaryOp { op: sq::UnaryOperator::Not, expr } => Node::Not(Box::new(convert_expr(expr))),
        sq::Expr::IsNull(inner) => Node::IsNull { node: Box::new(convert_expr(inner)), negated: false },
        sq::Expr::IsNotNull(inner) => Node::IsNull { node: Box::new(convert_expr(inner)), negated: true },
        sq::Expr::InList { expr, list, negated } => Node::InList {
            node: Box::new(convert_expr(expr)),
            list: list.iter().map(convert_expr).collect(),
            negated: *negated,
        },
        sq::Expr::Nested(inner) => convert_expr(inner),
        sq::Expr::Function(f) => convert_function(f).unwrap_or_else(|| Node::Raw(e.to_string())),
        _ => Node::Raw(e.to_string()),
    }
}

fn convert_value(v: &sq::Value) -> Node {
    match v {
        sq::Value::Number(n, _) => Node::Number(n.clone()),
        sq::Value::SingleQuotedString(s) | sq::Value::DoubleQuotedString(s) => Node::String(s.clone()),
        sq::Value::Boolean(b) => Node::Boolean(*b),
        sq::Value::Null => Node::Null,
        other => Node::Raw(other.to_string()),
    }
}

/// Named arguments (`field => x`) become `field = x` operators, the form `geohash_grid` uses.
fn convert_function(f: &sq::Function) -> Option<Node> {
    let name = f.name.to_string();
    let mut arguments = Vec::new();
    match &f.args {
        sq::FunctionArguments::None => {}
        sq::FunctionArguments::List(list) => {
            for arg in &list.args {
                match arg {
                    sq::FunctionArg::Unnamed(a) => arguments.push(convert_arg(a)),
                    sq::FunctionArg::Named { name, arg, .. } => {
                        arguments.push(Node::operator("=", Node::literal(name.value.clone()), convert_arg(arg)))
                    }
                    _ => return None,
                }
            }
        }
        sq::FunctionArguments::Subquery(_) => return None,
    }
    Some(Node::Function { name, arguments })
}

fn convert_arg(a: &sq::FunctionArgExpr) -> Node {
    match a {
        sq::FunctionArgExpr::Expr(e) => convert_expr(e),
        sq::FunctionArgExpr::Wildcard => Node::Raw("*".into()),
        sq::FunctionArgExpr::QualifiedWildcard(name) => Node::Raw(format!("{}.*", name)),
    }
}
