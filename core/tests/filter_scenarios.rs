//! End-to-end dispatch scenarios: digest a configuration, build a runtime,
//! filter a document, and check what fired in what order.

use std::sync::{Arc, Mutex};

use cedra::prelude::*;
use cedra::NS_CDRL_20;

/// Records every firing it receives into a shared log.
#[derive(Debug)]
struct Recorder {
    label: String,
    log: Arc<Mutex<Vec<String>>>,
    before: bool,
    children: bool,
    after: bool,
}

impl Recorder {
    fn record(&self, event: String) {
        self.log.lock().unwrap().push(format!("{}:{event}", self.label));
    }
}

impl Visitor for Recorder {
    fn as_before(&self) -> Option<&dyn BeforeVisitor> {
        self.before.then_some(self as &dyn BeforeVisitor)
    }
    fn as_children(&self) -> Option<&dyn ChildrenVisitor> {
        self.children.then_some(self as &dyn ChildrenVisitor)
    }
    fn as_after(&self) -> Option<&dyn AfterVisitor> {
        self.after.then_some(self as &dyn AfterVisitor)
    }
}

impl BeforeVisitor for Recorder {
    fn visit_before(
        &self,
        element: &PathElement,
        _ctx: &mut ExecutionContext,
    ) -> Result<(), FilterError> {
        let attrs = element
            .attributes
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        if attrs.is_empty() {
            self.record(format!("before:{}", element.local));
        } else {
            self.record(format!("before:{}[{attrs}]", element.local));
        }
        Ok(())
    }
}

impl ChildrenVisitor for Recorder {
    fn visit_child_text(
        &self,
        text: &str,
        element: &PathElement,
        _ctx: &mut ExecutionContext,
    ) -> Result<(), FilterError> {
        self.record(format!("child-text:{}:{text}", element.local));
        Ok(())
    }
    fn visit_child_element(
        &self,
        child: &PathElement,
        element: &PathElement,
        _ctx: &mut ExecutionContext,
    ) -> Result<(), FilterError> {
        self.record(format!("child-element:{}:{}", element.local, child.local));
        Ok(())
    }
}

impl AfterVisitor for Recorder {
    fn visit_after(
        &self,
        element: &PathElement,
        _ctx: &mut ExecutionContext,
    ) -> Result<(), FilterError> {
        self.record(format!("after:{}", element.local));
        Ok(())
    }
}

struct Harness {
    log: Arc<Mutex<Vec<String>>>,
    factory: ContentDeliveryRuntimeFactory,
}

impl Harness {
    /// Digest `body` (wrapped in the configuration root) with Recorder
    /// visitors registered under `visitor:<label>` resource names. The
    /// label encodes capabilities: `b`, `c`, `a` flags.
    fn new(body: &str) -> Self {
        let log = Arc::new(Mutex::new(Vec::new()));

        let registry_log = Arc::clone(&log);
        let visitors = Arc::new(
            VisitorRegistry::builder()
                .visitor("recorder", move |config| {
                    let label = config
                        .params()
                        .first("label")
                        .map(|p| p.value.clone())
                        .unwrap_or_else(|| "r".to_string());
                    let caps = config
                        .params()
                        .first("caps")
                        .map(|p| p.value.clone())
                        .unwrap_or_else(|| "ba".to_string());
                    Ok(Arc::new(Recorder {
                        label,
                        log: Arc::clone(&registry_log),
                        before: caps.contains('b'),
                        children: caps.contains('c'),
                        after: caps.contains('a'),
                    }) as Arc<dyn Visitor>)
                })
                .build(),
        );

        let source = format!(r#"<cedra-resource-list xmlns="{NS_CDRL_20}">{body}</cedra-resource-list>"#);
        let locator = InMemoryResourceLocator::new();
        let mut extensions = ExtensionDigesters::new();
        let seq = digest_config(&source, "root", &locator, &visitors, &mut extensions)
            .expect("digestion failed");

        Self {
            log,
            factory: ContentDeliveryRuntimeFactory::new(vec![Arc::new(seq)], visitors),
        }
    }

    fn filter(&self, source: &str) -> Vec<String> {
        let runtime = self
            .factory
            .create(&ProfileSet::new("default"), &[])
            .expect("runtime build failed");
        let mut ctx = runtime.new_execution_context();
        runtime.filter_source(source, &mut ctx).expect("filter failed");
        self.log.lock().unwrap().clone()
    }
}

fn recorder(selector: &str, label: &str, caps: &str) -> String {
    format!(
        r#"<resource-config selector="{selector}">
             <resource>recorder</resource>
             <param name="label">{label}</param>
             <param name="caps">{caps}</param>
           </resource-config>"#
    )
}

// Scenario: a simple resource config digests into a one-step selector
// with its parameter.
#[test]
fn simple_resource_config_digests_and_fires() {
    let harness = Harness::new(&recorder("order", "r", "ba"));
    let log = harness.filter("<order><item/></order>");
    assert_eq!(log, ["r:before:order", "r:after:order"]);
}

// Scenario: a.xml imports b.xml imports a.xml; the cycle fails digestion
// and the message names a.xml.
#[test]
fn import_cycle_fails_digestion() {
    let locator = InMemoryResourceLocator::new()
        .with(
            "conf/a.xml",
            format!(
                r#"<cedra-resource-list xmlns="{NS_CDRL_20}"><import file="b.xml"/></cedra-resource-list>"#
            ),
        )
        .with(
            "conf/b.xml",
            format!(
                r#"<cedra-resource-list xmlns="{NS_CDRL_20}"><import file="a.xml"/></cedra-resource-list>"#
            ),
        );

    let source = format!(
        r#"<cedra-resource-list xmlns="{NS_CDRL_20}"><import file="a.xml"/></cedra-resource-list>"#
    );
    let visitors = VisitorRegistry::builder().build();
    let mut extensions = ExtensionDigesters::new();
    let err = digest_config(&source, "conf", &locator, &visitors, &mut extensions).unwrap_err();

    let message = err.to_string();
    assert!(message.contains("a.xml"), "message should name a.xml: {message}");
    assert!(matches!(err.kind(), ConfigError::ImportCycle { .. }));
}

// Scenario: the parent passes a param to the import; the literal @ns@
// token in the child is substituted before digestion.
#[test]
fn parameterized_import_substitutes_before_digestion() {
    let locator = InMemoryResourceLocator::new().with(
        "conf/child.xml",
        format!(
            r#"<cedra-resource-list xmlns="{NS_CDRL_20}">
                 <resource-config selector="order"><param name="target-ns">@ns@</param></resource-config>
               </cedra-resource-list>"#
        ),
    );

    let source = format!(
        r#"<cedra-resource-list xmlns="{NS_CDRL_20}">
             <import file="child.xml"><param name="ns">http://x</param></import>
           </cedra-resource-list>"#
    );
    let visitors = VisitorRegistry::builder().build();
    let mut extensions = ExtensionDigesters::new();
    let seq = digest_config(&source, "conf", &locator, &visitors, &mut extensions).unwrap();

    let config = seq.resource_configs().next().unwrap();
    assert_eq!(config.params().first("target-ns").unwrap().value, "http://x");
}

// Scenario: two conditions with the same id in one block.
#[test]
fn duplicate_condition_id_fails_digestion() {
    let source = format!(
        r#"<cedra-resource-list xmlns="{NS_CDRL_20}">
             <conditions>
               <condition id="c1">a == 'x'</condition>
               <condition id="c1">b == 'y'</condition>
             </conditions>
             <resource-config selector="order"/>
           </cedra-resource-list>"#
    );
    let visitors = VisitorRegistry::builder().build();
    let mut extensions = ExtensionDigesters::new();
    let err = digest_config(
        &source,
        "conf",
        &InMemoryResourceLocator::new(),
        &visitors,
        &mut extensions,
    )
    .unwrap_err();
    assert!(matches!(err.kind(), ConfigError::DuplicateConditionId { .. }));
}

// Scenario: selector a/b[2]. Before fires only on the second <b> child of
// each <a>; the counter resets per parent.
#[test]
fn positional_selector_fires_on_second_child_of_each_parent() {
    let harness = Harness::new(&recorder("a/b[2]", "r", "b"));
    let log = harness.filter(
        "<doc>\
           <a><b n=\"1\"/><b n=\"2\"/><b n=\"3\"/></a>\
           <a><b n=\"4\"/><b n=\"5\"/></a>\
           <a><b n=\"6\"/></a>\
         </doc>",
    );
    assert_eq!(log, ["r:before:b[n=2]", "r:before:b[n=5]"]);
}

// Scenario: a Before-capable visitor bound to a text() selector is a
// configuration error naming the selector and the resource.
#[test]
fn text_selector_with_before_visitor_is_rejected() {
    let harness = Harness::new(&recorder("a/b/text()", "r", "b"));
    let err = harness
        .factory
        .create(&ProfileSet::new("default"), &[])
        .unwrap_err();

    match err.kind() {
        ConfigError::InvalidSelector { selector, reason } => {
            assert_eq!(selector, "a/b/text()");
            assert!(reason.contains("recorder"), "reason names the resource: {reason}");
        }
        other => panic!("expected InvalidSelector, got {other:?}"),
    }
}

// After-only visitors may target text() selectors.
#[test]
fn text_selector_with_after_only_visitor_fires() {
    let harness = Harness::new(&recorder("a/b/text()", "r", "a"));
    let log = harness.filter("<a><b>x</b><c/></a>");
    assert_eq!(log, ["r:after:b"]);
}

// Predicates evaluate left-to-right: the position counter's own selector
// carries the predicates written before the positional one, so it counts
// only elements matching them.
#[test]
fn position_counts_only_elements_matching_earlier_predicates() {
    let harness = Harness::new(&recorder("order/item[type = 'priority'][2]", "r", "b"));
    let log = harness.filter(
        "<order>\
           <item type=\"bulk\" n=\"1\"/>\
           <item type=\"priority\" n=\"2\"/>\
           <item type=\"bulk\" n=\"3\"/>\
           <item type=\"priority\" n=\"4\"/>\
         </order>",
    );
    // The second *priority* item is the fourth item overall.
    assert_eq!(log, ["r:before:item[type=priority,n=4]"]);
}

// Two handlers on the same dispatch key fire in binding order.
#[test]
fn same_key_handlers_fire_in_registration_order() {
    let harness = Harness::new(&format!(
        "{}{}",
        recorder("item", "first", "ba"),
        recorder("item", "second", "ba")
    ));
    let log = harness.filter("<order><item/></order>");
    assert_eq!(
        log,
        [
            "first:before:item",
            "second:before:item",
            "first:after:item",
            "second:after:item"
        ]
    );
}

// Child events fire once per direct child; nested content is not a direct
// child.
#[test]
fn child_visitors_fire_once_per_direct_child() {
    let harness = Harness::new(&recorder("order", "r", "bca"));
    let log = harness.filter("<order>x<item><deep/></item><note/></order>");

    let child_events: Vec<&String> = log.iter().filter(|e| e.contains("child")).collect();
    assert_eq!(
        child_events,
        [
            "r:child-text:order:x",
            "r:child-element:order:item",
            "r:child-element:order:note"
        ]
    );
    assert!(!log.iter().any(|e| e.contains("deep")));
}

// Conditions gate firing against execution variables seeded from global
// parameters.
#[test]
fn conditions_evaluate_against_global_parameters() {
    let harness = Harness::new(
        r#"<params><param name="channel">edi</param></params>
           <conditions><condition id="edi-only">channel == 'edi'</condition></conditions>
           <resource-config selector="order">
             <resource>recorder</resource>
             <condition idRef="edi-only"/>
             <param name="label">r</param>
             <param name="caps">b</param>
           </resource-config>"#,
    );
    let log = harness.filter("<order/>");
    assert_eq!(log, ["r:before:order"]);
}

// The reader resource's features reach the pooled readers: trim-text
// suppresses whitespace-only character events.
#[test]
fn reader_features_apply_to_pooled_readers() {
    let harness = Harness::new(&format!(
        r#"<reader class="default">
             <features><setOn feature="trim-text"/></features>
           </reader>
           {}"#,
        recorder("order", "r", "bc")
    ));
    let log = harness.filter("<doc><order>\n   <item/>\n </order></doc>");

    let text_events: Vec<&String> = log.iter().filter(|e| e.contains("child-text")).collect();
    assert!(text_events.is_empty(), "whitespace was trimmed: {text_events:?}");
    assert!(log.iter().any(|e| e.contains("child-element:order:item")));
}

// A failing visitor surfaces wrapped with its selector and resource
// identity.
#[test]
fn visitor_failures_carry_selector_and_resource() {
    #[derive(Debug)]
    struct Failing;

    impl Visitor for Failing {
        fn as_before(&self) -> Option<&dyn BeforeVisitor> {
            Some(self)
        }
    }

    impl BeforeVisitor for Failing {
        fn visit_before(
            &self,
            _element: &PathElement,
            _ctx: &mut ExecutionContext,
        ) -> Result<(), FilterError> {
            Err(FilterError::custom("downstream store unavailable"))
        }
    }

    let visitors = Arc::new(
        VisitorRegistry::builder()
            .visitor("com.acme.Failing", |_| Ok(Arc::new(Failing) as Arc<dyn Visitor>))
            .build(),
    );
    let source = format!(
        r#"<cedra-resource-list xmlns="{NS_CDRL_20}">
             <resource-config selector="order/item">
               <resource>com.acme.Failing</resource>
             </resource-config>
           </cedra-resource-list>"#
    );
    let mut extensions = ExtensionDigesters::new();
    let seq = digest_config(
        &source,
        "conf",
        &InMemoryResourceLocator::new(),
        &visitors,
        &mut extensions,
    )
    .unwrap();

    let factory = ContentDeliveryRuntimeFactory::new(vec![Arc::new(seq)], visitors);
    let runtime = factory.create(&ProfileSet::new("default"), &[]).unwrap();
    let mut ctx = runtime.new_execution_context();
    let err = runtime
        .filter_source("<order><item/></order>", &mut ctx)
        .unwrap_err();

    match err {
        FilterError::Visitor {
            selector, resource, ..
        } => {
            assert_eq!(selector, "order/item");
            assert_eq!(resource, "com.acme.Failing");
        }
        other => panic!("expected Visitor, got {other:?}"),
    }
}
