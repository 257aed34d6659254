//! Query tree handed to the rewriter and the scroll engine.
//!
//! The shape mirrors what the upstream SQL parser produces: a flat `select` list where a
//! compound field may arrive as three items (`base`, `Dot`, `sub`), a `where` tree of
//! conditional/operator/function/value nodes, and `group`/`order_by` lists of nodes.

#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryAst {
    pub select: Vec<SelectItem>,
    pub from: String,
    pub r#where: Option<Node>,
    pub group: Vec<Node>,
    pub order_by: Vec<OrderByItem>,
    pub limit: Option<u64>,
    pub delete: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectKind {
    Literal,
    Function,
    Wildcard,
    Dot,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectItem {
    pub kind: SelectKind,
    pub value: String,
    pub alias: Option<String>,
    pub arguments: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderByItem {
    pub node: Node,
    pub asc: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// AND / OR
    Conditional { op: String, left: Box<Node>, right: Box<Node> },
    Operator { op: String, left: Box<Node>, right: Box<Node> },
    Function { name: String, arguments: Vec<Node> },
    /// Field reference.
    Literal(String),
    String(String),
    Number(String),
    Boolean(bool),
    Null,
    Not(Box<Node>),
    IsNull { node: Box<Node>, negated: bool },
    InList { node: Box<Node>, list: Vec<Node>, negated: bool },
    Raw(String),
}

impl QueryAst {
    pub fn new(from: impl Into<String>) -> Self {
        Self { from: from.into(), ..Default::default() }
    }

    /// Position of the select item carrying `alias` (case-sensitive, as the engine treats column names).
    pub fn alias_position(&self, alias: &str) -> Option<usize> {
        self.select.iter().position(|s| s.alias.as_deref() == Some(alias))
    }
}

impl SelectItem {
    pub fn literal(value: impl Into<String>) -> Self {
        Self { kind: SelectKind::Literal, value: value.into(), alias: None, arguments: Vec::new() }
    }

    pub fn function(name: impl Into<String>, arguments: Vec<Node>) -> Self {
        Self { kind: SelectKind::Function, value: name.into(), alias: None, arguments }
    }

    pub fn wildcard() -> Self {
        Self { kind: SelectKind::Wildcard, value: "*".into(), alias: None, arguments: Vec::new() }
    }

    pub fn dot() -> Self {
        Self { kind: SelectKind::Dot, value: ".".into(), alias: None, arguments: Vec::new() }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Column name the engine synthesizes for this item when it carries no alias,
    /// e.g. `COUNT(*)` or `SUM(population)`.
    pub fn natural_name(&self) -> String {
        match self.kind {
            SelectKind::Function => {
                let args = self.arguments.iter().map(Node::render).collect::<Vec<_>>().join(", ");
                format!("{}({})", self.value, args)
            }
            _ => self.value.clone(),
        }
    }

    /// Select items convert to nodes when a GROUP BY alias resolves to them.
    pub fn to_node(&self) -> Node {
        match self.kind {
            SelectKind::Function => Node::Function { name: self.value.clone(), arguments: self.arguments.clone() },
            SelectKind::Wildcard => Node::Raw("*".into()),
            SelectKind::Literal | SelectKind::Dot => Node::Literal(self.value.clone()),
        }
    }
}

impl OrderByItem {
    pub fn asc(node: Node) -> Self { Self { node, asc: true } }
    pub fn desc(node: Node) -> Self { Self { node, asc: false } }
}

impl Node {
    pub fn literal(name: impl Into<String>) -> Self { Node::Literal(name.into()) }
    pub fn string(value: impl Into<String>) -> Self { Node::String(value.into()) }
    pub fn number(value: impl ToString) -> Self { Node::Number(value.to_string()) }

    pub fn function(name: impl Into<String>, arguments: Vec<Node>) -> Self {
        Node::Function { name: name.into(), arguments }
    }

    pub fn operator(op: impl Into<String>, left: Node, right: Node) -> Self {
        Node::Operator { op: op.into(), left: Box::new(left), right: Box::new(right) }
    }

    pub fn and(left: Node, right: Node) -> Self {
        Node::Conditional { op: "AND".into(), left: Box::new(left), right: Box::new(right) }
    }

    pub fn or(left: Node, right: Node) -> Self {
        Node::Conditional { op: "OR".into(), left: Box::new(left), right: Box::new(right) }
    }

    pub fn is_function_named(&self, wanted: &str) -> bool {
        matches!(self, Node::Function { name, .. } if name.eq_ignore_ascii_case(wanted))
    }

    /// Compact SQL-ish rendering used for synthesized column names.
    pub fn render(&self) -> String {
        match self {
            Node::Conditional { op, left, right } | Node::Operator { op, left, right } => {
                format!("{} {} {}", left.render(), op, right.render())
            }
            Node::Function { name, arguments } => {
                let args = arguments.iter().map(Node::render).collect::<Vec<_>>().join(", ");
                format!("{}({})", name, args)
            }
            Node::Literal(s) | Node::Number(s) | Node::Raw(s) => s.clone(),
            Node::String(s) => format!("'{}'", s),
            Node::Boolean(b) => if *b { "true".into() } else { "false".into() },
            Node::Null => "NULL".into(),
            Node::Not(inner) => format!("NOT {}", inner.render()),
            Node::IsNull { node, negated } => {
                format!("{} IS {}NULL", node.render(), if *negated { "NOT " } else { "" })
            }
            Node::InList { node, list, negated } => {
                let items = list.iter().map(Node::render).collect::<Vec<_>>().join(", ");
                format!("{} {}IN ({})", node.render(), if *negated { "NOT " } else { "" }, items)
            }
        }
    }
}
