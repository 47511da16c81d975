//! The engine façade: coordinates preparation, caching of prepared
//! templates, and rendering — the single entry point a host application
//! talks to, mirroring the teacher's `renderer/manager.rs` role of owning
//! the cache and wiring collaborators together behind one API.

use crate::cache::{CacheKey, TemplateCache};
use crate::cancel::CancellationToken;
use crate::coalesce;
use crate::config::Config;
use crate::context::Context;
use crate::error::{Error, Result, SharedError};
use crate::fragment::{Fragment, FragmentStore, IncludeStack};
use crate::functions::FunctionRegistry;
use crate::package::Package;
use crate::render::{self, ops, RenderEnv};
use crate::validate::{self, ValidateOptions, ValidationReport};
use crate::value::Value;
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::Arc;

/// The immutable, directive-indexed result of preparing a template source.
/// Shared across renders; a render never mutates it.
pub struct PreparedTemplate {
    source_id: String,
    package: Package,
    variables: BTreeSet<String>,
    functions: BTreeSet<(String, usize)>,
    fragments: BTreeSet<String>,
}

impl PreparedTemplate {
    /// Identifiers referenced by a bare variable lookup anywhere in the
    /// template, collected at preparation time.
    pub fn variables(&self) -> &BTreeSet<String> {
        &self.variables
    }

    pub fn functions(&self) -> &BTreeSet<(String, usize)> {
        &self.functions
    }

    pub fn fragments(&self) -> &BTreeSet<String> {
        &self.fragments
    }
}

/// Coordinates preparation (parse + coalesce + index), a bounded
/// single-flight cache of the result, and rendering against a supplied data
/// context. One process may host more than one `Engine`, each with its own
/// configuration, cache, and fragment/function registrations.
pub struct Engine {
    config: Config,
    functions: FunctionRegistry,
    fragments: RwLock<FragmentStore>,
    cache: TemplateCache<PreparedTemplate>,
}

impl Engine {
    /// Builds an engine from `config`, registering its built-in
    /// structural-op functions (`hide_row`, `hide_column`, `page_break`,
    /// `replace_link`, `raw_markup`) over the configured function registry,
    /// and pre-registering every fragment `config.fragments` lists.
    pub fn new(config: Config) -> Self {
        let mut functions = config.effective_functions();
        ops::register_builtins(&mut functions);

        let mut fragments = FragmentStore::new();
        for fragment in &config.fragments {
            fragments.register(fragment.clone());
        }

        Self {
            cache: TemplateCache::new(config.cache_capacity),
            config,
            functions,
            fragments: RwLock::new(fragments),
        }
    }

    /// Parses, coalesces, and statically indexes a template source,
    /// returning a cached result keyed by `source_id` and the content's
    /// fingerprint: re-preparing the same id with different bytes misses
    /// the cache rather than serving a stale entry. Concurrent callers
    /// preparing the same key block on the first caller rather than
    /// duplicating the work.
    pub fn prepare(
        &self,
        source_id: impl Into<String>,
        bytes: &[u8],
    ) -> Result<Arc<PreparedTemplate>, SharedError> {
        self.prepare_cancellable(source_id, bytes, None)
    }

    pub fn prepare_cancellable(
        &self,
        source_id: impl Into<String>,
        bytes: &[u8],
        cancel: Option<&CancellationToken>,
    ) -> Result<Arc<PreparedTemplate>, SharedError> {
        let source_id = source_id.into();
        let key = CacheKey::new(source_id.clone(), bytes);
        let fragments = self.fragments.read().clone();
        self.cache.get_or_prepare(key, || {
            if let Some(c) = cancel {
                c.check().map_err(Arc::new)?;
            }
            let mut package = Package::open(bytes).map_err(Arc::new)?;
            coalesce::coalesce_body(&mut package.document.body);

            let report = validate::validate(
                &package.document,
                "document.xml",
                &self.functions,
                &fragments,
                ValidateOptions::default(),
            );
            log::debug!(
                "prepared {source_id}: {} variable(s), {} function call site(s), {} fragment reference(s)",
                report.variables.len(),
                report.functions.len(),
                report.fragments.len(),
            );

            Ok(PreparedTemplate {
                source_id,
                package,
                variables: report.variables,
                functions: report.functions,
                fragments: report.fragments,
            })
        })
    }

    /// Renders `prepared` under `data`, producing a complete output
    /// document's bytes. Each call owns its own output tree and its own
    /// relationship-id counters seeded from the prepared template's
    /// original table; concurrent renders of the same prepared template
    /// never observe each other.
    pub fn render(&self, prepared: &PreparedTemplate, data: IndexMap<String, Value>) -> Result<Vec<u8>> {
        self.render_cancellable(prepared, data, None)
    }

    pub fn render_cancellable(
        &self,
        prepared: &PreparedTemplate,
        data: IndexMap<String, Value>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<u8>> {
        let start = std::time::Instant::now();
        let mut relationships = prepared.package.relationships.clone();
        let mut styles = prepared.package.styles.clone();
        let fragments = self.fragments.read().clone();
        let mut ctx = Context::new(data);
        let mut include_stack = IncludeStack::new(self.config.max_include_depth);

        let mut env = RenderEnv {
            functions: &self.functions,
            fragments: &fragments,
            host_relationships: &mut relationships,
            host_styles: &mut styles,
            opts: crate::eval::EvalOptions { strict: self.config.strict_mode },
            part: "document.xml".to_string(),
            cancel,
        };

        let rendered = render::render_document(&prepared.package.document, &mut ctx, &mut env, &mut include_stack)?;
        let output = prepared.package.with_rendered(rendered, relationships, styles);
        let bytes = output.save()?;
        log::debug!(
            "rendered {} in {:?} ({} bytes out)",
            prepared.source_id,
            start.elapsed(),
            bytes.len()
        );
        Ok(bytes)
    }

    /// Statically validates a prepared template against this engine's
    /// registries, without rendering.
    pub fn validate(&self, prepared: &PreparedTemplate, opts: ValidateOptions) -> ValidationReport {
        let fragments = self.fragments.read().clone();
        validate::validate(&prepared.package.document, "document.xml", &self.functions, &fragments, opts)
    }

    /// Registers a fragment, available to `{{include}}` in every render
    /// from now on. Per the concurrency model, callers must not register
    /// fragments concurrently with in-flight renders that might observe a
    /// torn registry; this engine enforces that with a reader-writer lock
    /// rather than requiring external synchronization.
    pub fn add_fragment(&self, fragment: Fragment) {
        self.fragments.write().register(fragment);
    }

    /// Prepares raw bytes as a named fragment and registers it.
    pub fn add_fragment_from_bytes(&self, name: impl Into<String>, bytes: &[u8]) -> Result<()> {
        let name = name.into();
        let mut package = Package::open(bytes).map_err(|e| match e {
            Error::DocumentParse(msg) => Error::DocumentParse(format!("fragment {name:?}: {msg}")),
            other => other,
        })?;
        coalesce::coalesce_body(&mut package.document.body);
        self.add_fragment(Fragment {
            name: name.clone(),
            body: package.document.body,
            relationships: package.relationships,
            styles: package.styles,
        });
        Ok(())
    }

    /// Drains the prepared-template cache. Any render already holding an
    /// `Arc<PreparedTemplate>` may continue to use it; this only affects
    /// future cache lookups.
    pub fn close(&self) {
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc::{Body, BodyElement, Document, Paragraph, ParagraphChild, Run};
    use crate::doc::relationships::RelationshipTable;
    use std::sync::Barrier;
    use std::thread;

    fn minimal_docx(paragraph_text: &str) -> Vec<u8> {
        use std::io::Write;
        let mut out = std::io::Cursor::new(Vec::new());
        {
            let mut zip = zip::ZipWriter::new(&mut out);
            let opts = zip::write::SimpleFileOptions::default()
                .compression_method(zip::CompressionMethod::Deflated);
            zip.start_file("_rels/.rels", opts).unwrap();
            zip.write_all(br#"<?xml version="1.0"?><Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="word/document.xml"/></Relationships>"#).unwrap();
            let doc_xml = format!(
                r#"<?xml version="1.0"?><w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><w:body><w:p><w:r><w:t>{paragraph_text}</w:t></w:r></w:p></w:body></w:document>"#
            );
            zip.start_file("word/document.xml", opts).unwrap();
            zip.write_all(doc_xml.as_bytes()).unwrap();
            zip.start_file("word/_rels/document.xml.rels", opts).unwrap();
            zip.write_all(br#"<?xml version="1.0"?><Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"></Relationships>"#).unwrap();
            zip.finish().unwrap();
        }
        out.into_inner()
    }

    #[test]
    fn prepares_and_renders_basic_substitution() {
        let engine = Engine::new(Config::default());
        let bytes = minimal_docx("Hello, {{name}}!");
        let prepared = engine.prepare("greeting", &bytes).unwrap();
        assert!(prepared.variables().contains("name"));

        let mut data = IndexMap::new();
        data.insert("name".to_string(), Value::str("Ada"));
        let output = engine.render(&prepared, data).unwrap();

        let reopened = Package::open(&output).unwrap();
        let BodyElement::Paragraph(p) = &reopened.document.body.children[0] else {
            panic!("expected a paragraph")
        };
        assert_eq!(p.text(), "Hello, Ada!");
    }

    #[test]
    fn repeated_prepare_of_the_same_bytes_is_a_cache_hit() {
        let engine = Engine::new(Config::default());
        let bytes = minimal_docx("{{x}}");
        let a = engine.prepare("t", &bytes).unwrap();
        let b = engine.prepare("t", &bytes).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn include_resolves_a_registered_fragment() {
        let engine = Engine::new(Config::default());
        engine.add_fragment(Fragment {
            name: "sig".to_string(),
            body: Body {
                children: vec![BodyElement::Paragraph(Paragraph {
                    content: vec![ParagraphChild::Run(Run::text("-- the team"))],
                    ..Default::default()
                })],
                ..Default::default()
            },
            relationships: RelationshipTable::new(),
            styles: Default::default(),
        });
        let bytes = minimal_docx(r#"{{include "sig"}}"#);
        let prepared = engine.prepare("t", &bytes).unwrap();
        let output = engine.render(&prepared, IndexMap::new()).unwrap();
        let reopened = Package::open(&output).unwrap();
        let BodyElement::Paragraph(p) = &reopened.document.body.children[0] else {
            panic!("expected a paragraph")
        };
        assert_eq!(p.text(), "-- the team");
    }

    #[test]
    fn concurrent_renders_of_one_prepared_template_are_byte_equal() {
        let engine = Arc::new(Engine::new(Config::default()));
        let bytes = minimal_docx("Hello, {{name}}!");
        let prepared = engine.prepare("t", &bytes).unwrap();
        let barrier = Arc::new(Barrier::new(4));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let engine = Arc::clone(&engine);
                let prepared = Arc::clone(&prepared);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let mut data = IndexMap::new();
                    data.insert("name".to_string(), Value::str("Ada"));
                    engine.render(&prepared, data).unwrap()
                })
            })
            .collect();

        let outputs: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for pair in outputs.windows(2) {
            assert_eq!(pair[0], pair[1]);
        }
    }

    #[test]
    fn validate_reports_an_unregistered_function() {
        let engine = Engine::new(Config::default());
        let bytes = minimal_docx("{{frobnicate(x)}}");
        let prepared = engine.prepare("t", &bytes).unwrap();
        let opts = ValidateOptions { check_functions: true, ..Default::default() };
        let report = engine.validate(&prepared, opts);
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn cancellation_aborts_a_render_with_cancelled_error() {
        let engine = Engine::new(Config::default());
        let bytes = minimal_docx("{{a}}");
        let prepared = engine.prepare("t", &bytes).unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let result = engine.render_cancellable(&prepared, IndexMap::new(), Some(&token));
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
