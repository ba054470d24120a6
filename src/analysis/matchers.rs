//! Declarative registry of name and marker patterns that make a symbol
//! reachable without an indexed caller.
//!
//! The same registry drives dead-code exemptions and process entry points.
//! The table is data, versioned, and can be extended from JSON.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::graph::Node;
use crate::ingest::Language;

/// Version of the built-in table. Bump on any change to [`builtin_specs`].
pub const BUILTIN_TABLE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatcherKind {
    /// Framework or program entry point
    EntryPoint,
    Constructor,
    /// Test function or test class by naming convention
    Test,
    /// Method invoked by a runtime or framework by name
    Lifecycle,
    /// Symbol carrying a registered decorator, annotation or attribute
    Marker,
}

impl MatcherKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatcherKind::EntryPoint => "entry_point",
            MatcherKind::Constructor => "constructor",
            MatcherKind::Test => "test",
            MatcherKind::Lifecycle => "lifecycle",
            MatcherKind::Marker => "marker",
        }
    }
}

/// One row of the table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatcherSpec {
    pub kind: MatcherKind,
    /// Restrict to one language; `None` applies everywhere
    #[serde(default)]
    pub language: Option<Language>,
    /// Regex over the symbol's short name
    #[serde(default)]
    pub name_pattern: Option<String>,
    /// Regex over any one of the symbol's markers
    #[serde(default)]
    pub marker_pattern: Option<String>,
}

impl MatcherSpec {
    fn name(kind: MatcherKind, language: Option<Language>, pattern: &str) -> Self {
        Self {
            kind,
            language,
            name_pattern: Some(pattern.to_string()),
            marker_pattern: None,
        }
    }

    fn marker(kind: MatcherKind, language: Option<Language>, pattern: &str) -> Self {
        Self {
            kind,
            language,
            name_pattern: None,
            marker_pattern: Some(pattern.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
struct Matcher {
    spec: MatcherSpec,
    name: Option<Regex>,
    marker: Option<Regex>,
}

impl Matcher {
    fn compile(spec: MatcherSpec) -> EngineResult<Self> {
        if spec.name_pattern.is_none() && spec.marker_pattern.is_none() {
            return Err(EngineError::Config(format!(
                "{} matcher needs a name or marker pattern",
                spec.kind.as_str()
            )));
        }
        let compile = |pattern: &Option<String>| -> EngineResult<Option<Regex>> {
            pattern
                .as_deref()
                .map(|p| {
                    Regex::new(p)
                        .map_err(|e| EngineError::Config(format!("invalid matcher pattern {:?}: {}", p, e)))
                })
                .transpose()
        };
        Ok(Self {
            name: compile(&spec.name_pattern)?,
            marker: compile(&spec.marker_pattern)?,
            spec,
        })
    }

    fn matches(&self, node: &Node, language: Option<Language>) -> bool {
        if let Some(wanted) = self.spec.language {
            if language != Some(wanted) {
                return false;
            }
        }
        if let Some(re) = &self.name {
            if !re.is_match(&node.name) {
                return false;
            }
        }
        if let Some(re) = &self.marker {
            if !node.prop_strings("markers").iter().any(|m| re.is_match(m)) {
                return false;
            }
        }
        true
    }
}

/// Versioned matcher table.
#[derive(Debug, Clone)]
pub struct MatcherRegistry {
    version: u32,
    matchers: Vec<Matcher>,
}

/// On-disk form of a registry extension.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatcherTable {
    pub version: u32,
    pub matchers: Vec<MatcherSpec>,
}

impl Default for MatcherRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl MatcherRegistry {
    /// The built-in table.
    pub fn builtin() -> Self {
        let matchers = builtin_specs()
            .into_iter()
            .filter_map(|spec| match Matcher::compile(spec) {
                Ok(m) => Some(m),
                Err(e) => {
                    tracing::error!(error = %e, "built-in matcher rejected");
                    None
                }
            })
            .collect();
        Self {
            version: BUILTIN_TABLE_VERSION,
            matchers,
        }
    }

    /// An empty table. Nothing is exempt.
    pub fn empty() -> Self {
        Self {
            version: 0,
            matchers: Vec::new(),
        }
    }

    pub fn from_specs(version: u32, specs: Vec<MatcherSpec>) -> EngineResult<Self> {
        let matchers = specs
            .into_iter()
            .map(Matcher::compile)
            .collect::<EngineResult<Vec<_>>>()?;
        Ok(Self { version, matchers })
    }

    /// Append the rows of a JSON [`MatcherTable`]. The registry takes the
    /// table's version when it is newer.
    pub fn extend_from_json(&mut self, json: &str) -> EngineResult<()> {
        let table: MatcherTable = serde_json::from_str(json)
            .map_err(|e| EngineError::Config(format!("invalid matcher table: {}", e)))?;
        for spec in table.matchers {
            self.matchers.push(Matcher::compile(spec)?);
        }
        self.version = self.version.max(table.version);
        Ok(())
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.matchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matchers.is_empty()
    }

    /// Whether any matcher of `kind` accepts `node`.
    pub fn matches(&self, kind: MatcherKind, node: &Node, language: Option<Language>) -> bool {
        self.matchers
            .iter()
            .filter(|m| m.spec.kind == kind)
            .any(|m| m.matches(node, language))
    }

    /// First kind (in `order`) that has a matcher accepting `node`.
    pub fn first_match(
        &self,
        order: &[MatcherKind],
        node: &Node,
        language: Option<Language>,
    ) -> Option<MatcherKind> {
        order
            .iter()
            .copied()
            .find(|kind| self.matches(*kind, node, language))
    }
}

/// Built-in table, version [`BUILTIN_TABLE_VERSION`].
pub fn builtin_specs() -> Vec<MatcherSpec> {
    use Language::*;
    use MatcherKind::*;

    vec![
        // entry points
        MatcherSpec::name(EntryPoint, None, r"^main$"),
        MatcherSpec::marker(
            EntryPoint,
            Some(Python),
            r"^@?\w*\.(route|get|post|put|patch|delete|websocket|api_route)\b",
        ),
        MatcherSpec::marker(EntryPoint, Some(Python), r"^@?(click|typer)\.(command|group)\b"),
        MatcherSpec::marker(EntryPoint, Some(Python), r"^@?(\w+\.)?(task|shared_task)\b"),
        MatcherSpec::marker(EntryPoint, Some(Python), r"^@?\w*\.(command|callback)\b"),
        MatcherSpec::name(EntryPoint, Some(JavaScript), r"^(handler|default)$"),
        MatcherSpec::name(EntryPoint, Some(TypeScript), r"^(handler|default)$"),
        MatcherSpec::marker(
            EntryPoint,
            Some(TypeScript),
            r"^@?(Get|Post|Put|Patch|Delete|Controller|Injectable|Component|Module)\b",
        ),
        MatcherSpec::marker(
            EntryPoint,
            Some(Java),
            r"^@?(GetMapping|PostMapping|PutMapping|DeleteMapping|PatchMapping|RequestMapping|Bean|Scheduled|EventListener|KafkaListener)\b",
        ),
        MatcherSpec::marker(EntryPoint, Some(Rust), r"^#\[(tokio|actix_web|async_std)::main\b"),
        MatcherSpec::marker(EntryPoint, Some(Rust), r"^#\[(get|post|put|delete|patch|route)\b"),
        MatcherSpec::name(EntryPoint, Some(Go), r"^(init|ServeHTTP)$"),
        // constructors
        MatcherSpec::name(Constructor, Some(Python), r"^(__init__|__new__|__post_init__)$"),
        MatcherSpec::name(Constructor, Some(JavaScript), r"^constructor$"),
        MatcherSpec::name(Constructor, Some(TypeScript), r"^constructor$"),
        MatcherSpec::name(Constructor, Some(Rust), r"^(new|default|with_capacity)$"),
        MatcherSpec::name(Constructor, Some(Go), r"^New[A-Z]?\w*$"),
        // tests
        MatcherSpec::name(Test, Some(Python), r"^(test_?\w*|Test\w*)$"),
        MatcherSpec::name(
            Test,
            Some(Python),
            r"^(setUp|tearDown|setUpClass|tearDownClass|setUpModule|tearDownModule|asyncSetUp|asyncTearDown)$",
        ),
        MatcherSpec::marker(Test, Some(Python), r"^@?pytest\.(fixture|mark)\b"),
        MatcherSpec::name(Test, Some(Go), r"^(Test|Benchmark|Example|Fuzz)[A-Z_]?\w*$"),
        MatcherSpec::marker(Test, Some(Java), r"^@?(Test|ParameterizedTest|BeforeEach|AfterEach|BeforeAll|AfterAll|Before|After)\b"),
        MatcherSpec::marker(Test, Some(Rust), r"^#\[((tokio::)?test|bench|rstest)\b"),
        MatcherSpec::name(Test, Some(JavaScript), r"^(describe|it|test|beforeEach|afterEach|beforeAll|afterAll)$"),
        MatcherSpec::name(Test, Some(TypeScript), r"^(describe|it|test|beforeEach|afterEach|beforeAll|afterAll)$"),
        // lifecycle
        MatcherSpec::name(Lifecycle, Some(Python), r"^__\w+__$"),
        MatcherSpec::name(
            Lifecycle,
            Some(JavaScript),
            r"^(render|componentDidMount|componentDidUpdate|componentWillUnmount|shouldComponentUpdate|getDerivedStateFromProps|connectedCallback|disconnectedCallback|attributeChangedCallback|toString|toJSON)$",
        ),
        MatcherSpec::name(
            Lifecycle,
            Some(TypeScript),
            r"^(render|componentDidMount|componentDidUpdate|componentWillUnmount|ngOnInit|ngOnDestroy|ngOnChanges|ngAfterViewInit|toString|toJSON)$",
        ),
        MatcherSpec::name(
            Lifecycle,
            Some(Rust),
            r"^(drop|fmt|from|try_from|into|clone|eq|partial_cmp|cmp|hash|deref|deref_mut|next|poll|from_str|as_ref|borrow|index|serialize|deserialize)$",
        ),
        MatcherSpec::name(Lifecycle, Some(Go), r"^(String|Error|Len|Less|Swap|MarshalJSON|UnmarshalJSON)$"),
        MatcherSpec::name(Lifecycle, Some(Java), r"^(toString|equals|hashCode|compareTo|run|call|close|finalize)$"),
        // markers
        MatcherSpec::marker(
            Marker,
            Some(Python),
            r"^@?(property|\w+\.setter|\w+\.deleter|staticmethod|classmethod|abstractmethod|cached_property|overload|override|receiver|hookimpl|validator|field_validator|model_validator)\b",
        ),
        MatcherSpec::marker(Marker, Some(Java), r"^@?(Override|PostConstruct|PreDestroy|Subscribe)\b"),
        MatcherSpec::marker(Marker, Some(Rust), r"^#\[(no_mangle|export_name|wasm_bindgen|pyfunction|pymethods|proc_macro\w*)\b"),
        MatcherSpec::marker(Marker, Some(TypeScript), r"^@?(Input|Output|HostListener)\b"),
    ]
}
