use super::{
    ast::{Node, OrderByItem, QueryAst, SelectItem, SelectKind},
    errors::QueryAstError,
};

/// Render a query tree back into the SQL text accepted by the translation endpoint.
///
/// Plain field selections lose their alias here (the translator would otherwise try to
/// resolve the alias as a field); function selections keep it because the alias names
/// the output column.
pub fn emit_sql(query: &QueryAst) -> Result<String, QueryAstError> {
    let mut emitter = SqlEmitter::default();
    emitter.emit(query)
}

#[derive(Debug, Default)]
struct SqlEmitter;

impl SqlEmitter {
    fn emit(&mut self, query: &QueryAst) -> Result<String, QueryAstError> {
        if query.from.trim().is_empty() {
            return Err(QueryAstError::Emit("missing FROM index".into()));
        }
        let mut sql = if query.delete {
            format!("DELETE FROM {}", query.from)
        } else {
            let proj = self.emit_projection(&query.select)?;
            format!("SELECT {} FROM {}", proj, query.from)
        };
        if let Some(pred) = &query.r#where {
            sql.push_str(&format!(" WHERE {}", self.emit_node(pred)?));
        }
        if !query.group.is_empty() {
            let grp = query
                .group
                .iter()
                .map(|g| self.emit_node(g))
                .collect::<Result<Vec<_>, _>>()?
                .join(", ");
            sql.push_str(&format!(" GROUP BY {}", grp));
        }
        if !query.order_by.is_empty() {
            let order = query
                .order_by
                .iter()
                .map(|o| self.emit_sort(o))
                .collect::<Result<Vec<_>, _>>()?
                .join(", ");
            sql.push_str(&format!(" ORDER BY {}", order));
        }
        if let Some(l) = query.limit {
            sql.push_str(&format!(" LIMIT {}", l));
        }
        Ok(sql)
    }

    fn emit_projection(&mut self, items: &[SelectItem]) -> Result<String, QueryAstError> {
        if items.is_empty() {
            return Ok("*".into());
        }
        let mut out = Vec::with_capacity(items.len());
        let mut i = 0;
        while i < items.len() {
            let item = &items[i];
            match item.kind {
                // `base . sub` arrives as three items; glue them back into one path
                SelectKind::Literal
                    if matches!(items.get(i + 1), Some(next) if next.kind == SelectKind::Dot) =>
                {
                    match items.get(i + 2) {
                        Some(sub) => {
                            out.push(format!("{}.{}", item.value, sub.value));
                            i += 3;
                        }
                        None => {
                            return Err(QueryAstError::Emit(format!(
                                "dangling '.' after {}",
                                item.value
                            )));
                        }
                    }
                    continue;
                }
                SelectKind::Literal => out.push(item.value.clone()),
                SelectKind::Wildcard => out.push("*".into()),
                SelectKind::Dot => return Err(QueryAstError::Emit("unexpected '.' in select list".into())),
                SelectKind::Function => {
                    let call = self.emit_call(&item.value, &item.arguments)?;
                    match &item.alias {
                        Some(alias) => out.push(format!("{} AS {}", call, alias)),
                        None => out.push(call),
                    }
                }
            }
            i += 1;
        }
        Ok(out.join(", "))
    }

    fn emit_sort(&mut self, item: &OrderByItem) -> Result<String, QueryAstError> {
        Ok(format!("{} {}", self.emit_node(&item.node)?, if item.asc { "ASC" } else { "DESC" }))
    }

    fn emit_call(&mut self, name: &str, args: &[Node]) -> Result<String, QueryAstError> {
        let args_sql = args
            .iter()
            .map(|a| self.emit_node(a))
            .collect::<Result<Vec<_>, _>>()?
            .join(", ");
        Ok(format!("{}({})", name, args_sql))
    }

    fn emit_node(&mut self, node: &Node) -> Result<String, QueryAstError> {
        Ok(match node {
            Node::Conditional { op, left, right } => {
                format!("({} {} {})", self.emit_node(left)?, op.to_ascii_uppercase(), self.emit_node(right)?)
            }
            Node::Operator { op, left, right } => {
                format!("{} {} {}", self.emit_operand(left)?, op, self.emit_operand(right)?)
            }
            Node::Function { name, arguments } => self.emit_call(name, arguments)?,
            Node::Literal(name) => name.clone(),
            Node::String(s) => quote_string(s),
            Node::Number(n) => n.clone(),
            Node::Boolean(b) => if *b { "true".into() } else { "false".into() },
            Node::Null => "NULL".into(),
            Node::Not(inner) => format!("NOT {}", self.emit_node(inner)?),
            Node::IsNull { node, negated } => {
                if *negated {
                    format!("{} IS NOT NULL", self.emit_node(node)?)
                } else {
                    format!("{} IS NULL", self.emit_node(node)?)
                }
            }
            Node::InList { node, list, negated } => {
                let items = list
                    .iter()
                    .map(|e| self.emit_node(e))
                    .collect::<Result<Vec<_>, _>>()?
                    .join(", ");
                if *negated {
                    format!("{} NOT IN ({})", self.emit_node(node)?, items)
                } else {
                    format!("{} IN ({})", self.emit_node(node)?, items)
                }
            }
            Node::Raw(r) => r.clone(),
        })
    }

    /// Operator trees lose their grouping on parse, so nested operators are always bracketed.
    fn emit_operand(&mut self, node: &Node) -> Result<String, QueryAstError> {
        match node {
            Node::Operator { .. } => Ok(format!("({})", self.emit_node(node)?)),
            _ => self.emit_node(node),
        }
    }
}

fn quote_string(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_field_alias_is_dropped_function_alias_kept() {
        let mut q = QueryAst::new("countries");
        q.select = vec![
            SelectItem::literal("iso").with_alias("code"),
            SelectItem::function("COUNT", vec![Node::Raw("*".into())]).with_alias("the_count"),
        ];
        q.group = vec![Node::literal("iso")];
        let sql = emit_sql(&q).unwrap();
        assert_eq!(sql, "SELECT iso, COUNT(*) AS the_count FROM countries GROUP BY iso");
    }

    #[test]
    fn dotted_select_is_glued_back() {
        let mut q = QueryAst::new("idx");
        q.select = vec![
            SelectItem::literal("year_data"),
            SelectItem::dot(),
            SelectItem::literal("year").with_alias("year"),
        ];
        assert_eq!(emit_sql(&q).unwrap(), "SELECT year_data.year FROM idx");
    }

    #[test]
    fn where_order_limit() {
        let mut q = QueryAst::new("idx");
        q.r#where = Some(Node::and(
            Node::operator("=", Node::literal("name"), Node::string("O'Hara")),
            Node::operator(">", Node::literal("pop"), Node::number(10)),
        ));
        q.order_by = vec![OrderByItem::desc(Node::literal("pop"))];
        q.limit = Some(5);
        assert_eq!(
            emit_sql(&q).unwrap(),
            "SELECT * FROM idx WHERE (name = 'O''Hara' AND pop > 10) ORDER BY pop DESC LIMIT 5"
        );
    }

    #[test]
    fn arithmetic_grouping_is_kept() {
        let mut q = QueryAst::new("idx");
        q.r#where = Some(Node::operator(
            ">",
            Node::operator("*", Node::operator("+", Node::literal("pop"), Node::number(1)), Node::number(2)),
            Node::number(10),
        ));
        assert_eq!(emit_sql(&q).unwrap(), "SELECT * FROM idx WHERE ((pop + 1) * 2) > 10");
    }

    #[test]
    fn delete_intent() {
        let mut q = QueryAst::new("idx");
        q.delete = true;
        q.r#where = Some(Node::operator("=", Node::literal("a"), Node::number(1)));
        assert_eq!(emit_sql(&q).unwrap(), "DELETE FROM idx WHERE a = 1");
    }

    #[test]
    fn missing_from_is_an_error() {
        assert!(emit_sql(&QueryAst::default()).is_err());
    }
}
