//! The streaming XML event source and its bounded reader pool.
//!
//! A [`CdrReader`] drives a source document through an
//! [`XmlEventHandler`], notifying it of element starts, character data and
//! element ends. Namespaces are resolved by the underlying `quick-xml`
//! `NsReader`; empty-element tags are delivered as a start immediately
//! followed by an end.
//!
//! Readers are pooled per delivery runtime: [`ReaderPool::acquire`] blocks
//! until a reader is free or the configured timeout elapses. A released
//! reader is reset to initial state; a reader that failed mid-document is
//! discarded and a replacement is created on the next acquire.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use quick_xml::events::Event;
use quick_xml::name::ResolveResult;
use quick_xml::reader::NsReader;
use tracing::debug;

use crate::error::FilterError;
use crate::param::ParameterMap;
use crate::selector::PathElement;

/// Receives the decoded event stream of one source document.
pub trait XmlEventHandler {
    /// An element started. Attributes are decoded; the namespace is
    /// resolved when bound.
    fn start_element(&mut self, element: PathElement) -> Result<(), FilterError>;

    /// Character data directly under the current element.
    fn characters(&mut self, text: &str) -> Result<(), FilterError>;

    /// The current element ended.
    fn end_element(&mut self, local: &str) -> Result<(), FilterError>;
}

/// Feature name: trim leading/trailing whitespace from character data.
pub const FEATURE_TRIM_TEXT: &str = "trim-text";

/// Feature name: verify that end tags match their start tags.
pub const FEATURE_CHECK_END_NAMES: &str = "check-end-names";

/// Reader configuration extracted from the `xml.reader.driver` resource.
#[derive(Debug, Clone)]
pub struct ReaderSettings {
    /// Trim character data (off by default).
    pub trim_text: bool,
    /// Check end-tag names (on by default).
    pub check_end_names: bool,
    /// Configured `sax-handler` entries, in document order. Instantiation
    /// of these is the host's concern; the engine carries them through.
    pub handlers: Vec<String>,
    /// Feature names that are not recognized; surfaced on first use.
    unknown_features: Vec<String>,
}

impl Default for ReaderSettings {
    fn default() -> Self {
        Self {
            trim_text: false,
            check_end_names: true,
            handlers: Vec::new(),
            unknown_features: Vec::new(),
        }
    }
}

impl ReaderSettings {
    /// Build settings from the reader resource's parameter map.
    ///
    /// `feature-on` / `feature-off` entries toggle known features; unknown
    /// feature names are kept and reported when the reader is first used.
    #[must_use]
    pub fn from_params(params: &ParameterMap) -> Self {
        let mut settings = Self::default();
        for param in params.iter() {
            let on = match param.name.as_str() {
                "feature-on" => true,
                "feature-off" => false,
                "sax-handler" => {
                    settings.handlers.push(param.value.clone());
                    continue;
                }
                _ => continue,
            };
            match param.value.as_str() {
                FEATURE_TRIM_TEXT => settings.trim_text = on,
                FEATURE_CHECK_END_NAMES => settings.check_end_names = on,
                unknown => settings.unknown_features.push(unknown.to_string()),
            }
        }
        settings
    }
}

/// A configured, poolable XML event reader.
#[derive(Debug)]
pub struct CdrReader {
    settings: ReaderSettings,
    at_document_boundary: bool,
}

impl CdrReader {
    /// Create a reader with the given settings.
    #[must_use]
    pub fn new(settings: ReaderSettings) -> Self {
        Self {
            settings,
            at_document_boundary: true,
        }
    }

    /// Whether the reader last stopped at a consistent document boundary.
    ///
    /// Decides release-versus-discard when the reader returns to its pool.
    #[must_use]
    pub fn at_document_boundary(&self) -> bool {
        self.at_document_boundary
    }

    /// Reset to initial state before returning to the pool.
    pub fn reset(&mut self) {
        self.at_document_boundary = true;
    }

    /// Drive `source` through the handler.
    pub fn read(
        &mut self,
        source: &str,
        handler: &mut dyn XmlEventHandler,
    ) -> Result<(), FilterError> {
        if let Some(feature) = self.settings.unknown_features.first() {
            return Err(FilterError::UnsupportedFeature {
                feature: feature.clone(),
            });
        }

        self.at_document_boundary = false;

        let mut reader = NsReader::from_str(source);
        reader.config_mut().trim_text(self.settings.trim_text);
        reader.config_mut().check_end_names = self.settings.check_end_names;

        loop {
            let (resolve, event) = reader.read_resolved_event().map_err(xml_syntax)?;
            match event {
                Event::Start(start) => {
                    handler.start_element(decode_element(&resolve, &start)?)?;
                }
                Event::Empty(start) => {
                    let element = decode_element(&resolve, &start)?;
                    let local = element.local.clone();
                    handler.start_element(element)?;
                    handler.end_element(&local)?;
                }
                Event::Text(text) => {
                    let text = text.unescape().map_err(xml_syntax)?;
                    handler.characters(&text)?;
                }
                Event::CData(data) => {
                    let text = String::from_utf8_lossy(&data).into_owned();
                    handler.characters(&text)?;
                }
                Event::End(end) => {
                    let local = String::from_utf8_lossy(end.local_name().as_ref()).into_owned();
                    handler.end_element(&local)?;
                }
                Event::Eof => break,
                _ => {}
            }
        }

        self.at_document_boundary = true;
        Ok(())
    }
}

fn decode_element(
    resolve: &ResolveResult<'_>,
    start: &quick_xml::events::BytesStart<'_>,
) -> Result<PathElement, FilterError> {
    let local = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
    let namespace = match resolve {
        ResolveResult::Bound(ns) => Some(String::from_utf8_lossy(ns.into_inner()).into_owned()),
        _ => None,
    };

    let mut attributes = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(xml_syntax)?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        // Namespace declarations are reader plumbing, not element data.
        if attr.key.as_ref() == b"xmlns" || attr.key.as_ref().starts_with(b"xmlns:") {
            continue;
        }
        let value = attr.unescape_value().map_err(xml_syntax)?.into_owned();
        attributes.push((key, value));
    }

    Ok(PathElement {
        local,
        namespace,
        attributes,
    })
}

fn xml_syntax(error: impl std::fmt::Display) -> FilterError {
    FilterError::XmlSyntax {
        reason: error.to_string(),
    }
}

/// A blocking bounded pool of [`CdrReader`]s.
pub struct ReaderPool {
    settings: ReaderSettings,
    capacity: usize,
    timeout: Duration,
    state: Mutex<PoolState>,
    available: Condvar,
}

#[derive(Debug, Default)]
struct PoolState {
    idle: Vec<CdrReader>,
    leased: usize,
}

impl ReaderPool {
    /// Create a pool of at most `capacity` readers sharing `settings`.
    #[must_use]
    pub fn new(settings: ReaderSettings, capacity: usize, timeout: Duration) -> Self {
        Self {
            settings,
            capacity: capacity.max(1),
            timeout,
            state: Mutex::new(PoolState::default()),
            available: Condvar::new(),
        }
    }

    /// Maximum number of readers this pool hands out.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Take a reader, waiting until one is free or the timeout elapses.
    pub fn acquire(&self) -> Result<CdrReader, FilterError> {
        let deadline = Instant::now() + self.timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(reader) = state.idle.pop() {
                state.leased += 1;
                return Ok(reader);
            }
            if state.leased < self.capacity {
                state.leased += 1;
                return Ok(CdrReader::new(self.settings.clone()));
            }
            if self.available.wait_until(&mut state, deadline).timed_out() {
                return Err(FilterError::ReaderAcquireTimeout {
                    timeout: self.timeout,
                });
            }
        }
    }

    /// Return a reader to the pool, reset to initial state.
    pub fn release(&self, mut reader: CdrReader) {
        reader.reset();
        let mut state = self.state.lock();
        state.leased = state.leased.saturating_sub(1);
        state.idle.push(reader);
        drop(state);
        self.available.notify_one();
    }

    /// Drop a reader that failed mid-document; a replacement is created on
    /// the next acquire.
    pub fn discard(&self, reader: CdrReader) {
        debug!("discarding reader that stopped off a document boundary");
        drop(reader);
        let mut state = self.state.lock();
        state.leased = state.leased.saturating_sub(1);
        drop(state);
        self.available.notify_one();
    }
}

impl std::fmt::Debug for ReaderPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ReaderPool")
            .field("capacity", &self.capacity)
            .field("idle", &state.idle.len())
            .field("leased", &state.leased)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingHandler {
        events: Vec<String>,
    }

    impl XmlEventHandler for RecordingHandler {
        fn start_element(&mut self, element: PathElement) -> Result<(), FilterError> {
            self.events.push(format!("start:{}", element.local));
            Ok(())
        }

        fn characters(&mut self, text: &str) -> Result<(), FilterError> {
            self.events.push(format!("text:{text}"));
            Ok(())
        }

        fn end_element(&mut self, local: &str) -> Result<(), FilterError> {
            self.events.push(format!("end:{local}"));
            Ok(())
        }
    }

    #[test]
    fn event_stream_covers_start_text_end() {
        let mut reader = CdrReader::new(ReaderSettings {
            trim_text: true,
            ..ReaderSettings::default()
        });
        let mut handler = RecordingHandler::default();
        reader
            .read("<order><item qty=\"2\">widget</item></order>", &mut handler)
            .unwrap();

        assert_eq!(
            handler.events,
            [
                "start:order",
                "start:item",
                "text:widget",
                "end:item",
                "end:order"
            ]
        );
        assert!(reader.at_document_boundary());
    }

    #[test]
    fn empty_elements_deliver_start_then_end() {
        let mut reader = CdrReader::new(ReaderSettings::default());
        let mut handler = RecordingHandler::default();
        reader.read("<a><b/></a>", &mut handler).unwrap();
        assert_eq!(handler.events, ["start:a", "start:b", "end:b", "end:a"]);
    }

    #[test]
    fn malformed_source_leaves_reader_off_boundary() {
        let mut reader = CdrReader::new(ReaderSettings::default());
        let mut handler = RecordingHandler::default();
        let err = reader.read("<a><b></a>", &mut handler).unwrap_err();
        assert!(matches!(err, FilterError::XmlSyntax { .. }));
        assert!(!reader.at_document_boundary());
    }

    #[test]
    fn unknown_feature_is_surfaced_on_use() {
        let mut params = ParameterMap::new();
        params.set("feature-on", "http://acme.com/feature/unknown");
        let settings = ReaderSettings::from_params(&params);

        let mut reader = CdrReader::new(settings);
        let err = reader
            .read("<a/>", &mut RecordingHandler::default())
            .unwrap_err();
        match err {
            FilterError::UnsupportedFeature { feature } => {
                assert_eq!(feature, "http://acme.com/feature/unknown");
            }
            other => panic!("expected UnsupportedFeature, got {other:?}"),
        }
    }

    #[test]
    fn settings_collect_repeated_sax_handlers() {
        let mut params = ParameterMap::new();
        params.set("sax-handler", "first.Handler");
        params.set("sax-handler", "second.Handler");
        params.set("feature-on", FEATURE_TRIM_TEXT);
        let settings = ReaderSettings::from_params(&params);

        assert_eq!(settings.handlers, ["first.Handler", "second.Handler"]);
        assert!(settings.trim_text);
    }

    #[test]
    fn pool_reuses_released_readers_and_times_out_when_exhausted() {
        let pool = ReaderPool::new(
            ReaderSettings::default(),
            1,
            Duration::from_millis(50),
        );

        let reader = pool.acquire().unwrap();
        let err = pool.acquire().unwrap_err();
        assert!(matches!(err, FilterError::ReaderAcquireTimeout { .. }));

        pool.release(reader);
        let again = pool.acquire().unwrap();
        assert!(again.at_document_boundary());
    }

    #[test]
    fn discard_makes_room_for_a_replacement() {
        let pool = ReaderPool::new(
            ReaderSettings::default(),
            1,
            Duration::from_millis(50),
        );
        let reader = pool.acquire().unwrap();
        pool.discard(reader);
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn blocked_acquire_wakes_on_release() {
        use std::sync::Arc;

        let pool = Arc::new(ReaderPool::new(
            ReaderSettings::default(),
            1,
            Duration::from_secs(5),
        ));
        let reader = pool.acquire().unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || pool.acquire().map(|_| ()))
        };
        std::thread::sleep(Duration::from_millis(20));
        pool.release(reader);

        waiter.join().unwrap().unwrap();
    }
}
