use crate::config::{ID_FIELD, LINK_BATCH_SIZE, PARENT_LOOKUP_CHUNK, QUERY_PAGE_SIZE, TIMESTAMP_FIELD};
use crate::error::IndexError;
use crate::index::{for_each_page, Filter, IndexService, Query};
use crate::loader::make_spinner;
use crate::models::{Document, LinkDocument, RelationScope};
use crate::stats::LinkStats;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationKind {
    MultiVolume,
    SerialVolume,
    Article,
}

impl RelationKind {
    pub const ALL: [RelationKind; 3] = [
        RelationKind::MultiVolume,
        RelationKind::SerialVolume,
        RelationKind::Article,
    ];

    /// Value written into the parent's child type list.
    pub fn label(self) -> &'static str {
        match self {
            RelationKind::MultiVolume => "multivolume",
            RelationKind::SerialVolume => "serialvolume",
            RelationKind::Article => "article",
        }
    }
}

/// Child-side fields of one relation kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationFields {
    /// Parent catalog number(s) as cataloged on the child.
    pub parent_ac: String,
    /// Written by phase 1: parent document id(s).
    pub parent_sys: String,
    /// Written by phase 1: parent title(s).
    pub parent_title: String,
}

impl RelationFields {
    fn new(parent_ac: &str, parent_sys: &str, parent_title: &str) -> Self {
        Self {
            parent_ac: parent_ac.to_string(),
            parent_sys: parent_sys.to_string(),
            parent_title: parent_title.to_string(),
        }
    }
}

/// Index field names used by the linker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSchema {
    pub multi_volume: RelationFields,
    pub serial_volume: RelationFields,
    pub article: RelationFields,
    pub catalog_no: String,
    pub title: String,
    pub volume_no: String,
    pub volume_no_sort: String,
    pub edition: String,
    pub publish_date: String,
    pub childs_type: String,
    pub childs_sys: String,
    pub childs_ac: String,
    pub childs_title: String,
    pub childs_volume_no: String,
    pub childs_volume_no_sort: String,
    pub childs_edition: String,
    pub childs_publish_date: String,
    pub timestamp: String,
    /// Keeps the parallel child summary lists aligned when a child lacks a value.
    pub missing_value: String,
}

impl Default for LinkSchema {
    fn default() -> Self {
        Self {
            multi_volume: RelationFields::new("parentMultiAC_str", "parentMultiSYS_str", "parentMultiTitle_str"),
            serial_volume: RelationFields::new(
                "parentSeriesAC_str_mv",
                "parentSeriesSYS_str_mv",
                "parentSeriesTitle_str_mv",
            ),
            article: RelationFields::new("articleParentAC_str", "articleParentSYS_str", "articleParentTitle_str"),
            catalog_no: "acNo_txt".to_string(),
            title: "title".to_string(),
            volume_no: "volumeNo_str".to_string(),
            volume_no_sort: "volumeNoSort_str".to_string(),
            edition: "edition".to_string(),
            publish_date: "publishDate".to_string(),
            childs_type: "childsType_str_mv".to_string(),
            childs_sys: "childsSYS_str_mv".to_string(),
            childs_ac: "childsAC_str_mv".to_string(),
            childs_title: "childsTitle_str_mv".to_string(),
            childs_volume_no: "childsVolumeNo_str_mv".to_string(),
            childs_volume_no_sort: "childsVolumeNoSort_str_mv".to_string(),
            childs_edition: "childsEdition_str_mv".to_string(),
            childs_publish_date: "childsPublishDate_str_mv".to_string(),
            timestamp: TIMESTAMP_FIELD.to_string(),
            missing_value: "0".to_string(),
        }
    }
}

impl LinkSchema {
    pub fn relation(&self, kind: RelationKind) -> &RelationFields {
        match kind {
            RelationKind::MultiVolume => &self.multi_volume,
            RelationKind::SerialVolume => &self.serial_volume,
            RelationKind::Article => &self.article,
        }
    }

    /// Parent fields rebuilt by phases 2 to 4, in list order.
    pub fn summary_fields(&self) -> [&str; 8] {
        [
            self.childs_type.as_str(),
            self.childs_sys.as_str(),
            self.childs_ac.as_str(),
            self.childs_title.as_str(),
            self.childs_volume_no.as_str(),
            self.childs_volume_no_sort.as_str(),
            self.childs_edition.as_str(),
            self.childs_publish_date.as_str(),
        ]
    }

    fn child_fields(&self) -> Vec<&str> {
        let mut fields = vec![
            self.catalog_no.as_str(),
            self.title.as_str(),
            self.volume_no.as_str(),
            self.volume_no_sort.as_str(),
            self.edition.as_str(),
            self.publish_date.as_str(),
        ];
        for kind in RelationKind::ALL {
            let relation = self.relation(kind);
            fields.push(&relation.parent_ac);
            fields.push(&relation.parent_sys);
        }
        fields
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    ParentToChild,
    UnlinkStaleChildren,
    RelinkFromChildren,
    RelinkFromParents,
    AuthorityCounts,
    Optimize,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::ParentToChild => "parent-to-child",
            Phase::UnlinkStaleChildren => "unlink-stale-children",
            Phase::RelinkFromChildren => "relink-from-children",
            Phase::RelinkFromParents => "relink-from-parents",
            Phase::AuthorityCounts => "authority-counts",
            Phase::Optimize => "optimize",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkReport {
    pub phases: Vec<(Phase, bool)>,
    pub success: bool,
}

impl LinkReport {
    fn new() -> Self {
        Self {
            phases: Vec::new(),
            success: true,
        }
    }

    fn record(&mut self, phase: Phase, ok: bool) {
        self.phases.push((phase, ok));
        self.success &= ok;
    }
}

/// Partial updates waiting to be sent, flushed every `capacity` documents.
struct LinkBuffer {
    docs: Vec<LinkDocument>,
    capacity: usize,
}

impl LinkBuffer {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            docs: Vec::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, index: &dyn IndexService, stats: &LinkStats, doc: LinkDocument) -> Result<(), IndexError> {
        self.docs.push(doc);
        if self.docs.len() >= self.capacity {
            self.flush(index, stats)?;
        }
        Ok(())
    }

    fn flush(&mut self, index: &dyn IndexService, stats: &LinkStats) -> Result<(), IndexError> {
        if self.docs.is_empty() {
            return Ok(());
        }
        let docs = std::mem::take(&mut self.docs);
        index.update(&docs)?;
        stats.add_written(docs.len() as u64);
        debug!(docs = docs.len(), "Link batch written");
        Ok(())
    }

    fn discard(&mut self) -> usize {
        let dropped = self.docs.len();
        self.docs.clear();
        dropped
    }
}

/// A parent resolved by catalog number.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ParentRef {
    id: String,
    title: String,
}

/// Repairs parent/child references for the documents written by one load:
///
/// 1. **ParentToChild**: children of the run get their parent's id and title.
/// 2. **UnlinkStaleChildren**: the summaries of those parents are cleared.
/// 3. **RelinkFromChildren**: the summaries are rebuilt from all indexed children.
/// 4. **RelinkFromParents**: parents of the run still without children look them
///    up by their own id and catalog number.
///
/// Each phase ends with a commit, so the next phase sees its writes.
pub struct Linker<'a> {
    index: &'a dyn IndexService,
    schema: LinkSchema,
    page_size: usize,
    buffer: LinkBuffer,
    stats: LinkStats,
    parent_cache: FxHashMap<String, Option<ParentRef>>,
    /// Parent id to catalog number, for parents referenced by this run's children.
    parents: BTreeMap<String, String>,
}

impl<'a> Linker<'a> {
    pub fn new(index: &'a dyn IndexService) -> Self {
        Self::with_schema(index, LinkSchema::default())
    }

    pub fn with_schema(index: &'a dyn IndexService, schema: LinkSchema) -> Self {
        Self {
            index,
            schema,
            page_size: QUERY_PAGE_SIZE,
            buffer: LinkBuffer::new(LINK_BATCH_SIZE),
            stats: LinkStats::new(),
            parent_cache: FxHashMap::default(),
            parents: BTreeMap::new(),
        }
    }

    pub fn page_size(mut self, rows: usize) -> Self {
        self.page_size = rows.max(1);
        self
    }

    pub fn batch_size(mut self, docs: usize) -> Self {
        self.buffer = LinkBuffer::new(docs);
        self
    }

    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }

    /// Runs the four phases for one load. A failed phase is logged and the
    /// next phase still runs.
    pub fn run(&mut self, scope: &RelationScope, optimize: bool) -> LinkReport {
        let pb = make_spinner("Linking");
        let mut report = LinkReport::new();
        self.parents.clear();
        self.parent_cache.clear();

        for phase in [
            Phase::ParentToChild,
            Phase::UnlinkStaleChildren,
            Phase::RelinkFromChildren,
            Phase::RelinkFromParents,
        ] {
            pb.set_message(format!("Linking: {phase}"));
            info!(%phase, timestamp = %scope.load_timestamp, "Link phase started");
            let result = match phase {
                Phase::ParentToChild => self.parent_to_child(scope),
                Phase::UnlinkStaleChildren => self.unlink_stale_children(),
                Phase::RelinkFromChildren => self.relink_from_children(),
                _ => self.relink_from_parents(scope),
            };
            let ok = self.end_phase(phase, result);
            report.record(phase, ok);
        }

        if optimize {
            let ok = match self.index.optimize() {
                Ok(()) => true,
                Err(e) => {
                    error!(error = %e, "Optimize failed");
                    false
                }
            };
            report.record(Phase::Optimize, ok);
        }

        pb.finish_and_clear();
        info!(stats = %self.stats, success = report.success, "Linking finished");
        report
    }

    /// Flushes and commits after a phase, or abandons its pending writes.
    fn end_phase(&mut self, phase: Phase, result: Result<(), IndexError>) -> bool {
        let result = result
            .and_then(|()| self.buffer.flush(self.index, &self.stats))
            .and_then(|()| self.index.commit());
        match result {
            Ok(()) => {
                info!(%phase, "Link phase committed");
                true
            }
            Err(e) => {
                let dropped = self.buffer.discard();
                self.stats.inc_failed_phases();
                error!(%phase, error = %e, dropped, "Link phase abandoned");
                // keep whatever did reach the index visible to the next phase
                if let Err(e) = self.index.commit() {
                    warn!(%phase, error = %e, "Commit after abandoned phase failed");
                }
                false
            }
        }
    }

    fn parent_to_child(&mut self, scope: &RelationScope) -> Result<(), IndexError> {
        let index = self.index;
        for kind in RelationKind::ALL {
            let relation = self.schema.relation(kind).clone();
            let query = Query::new(self.page_size)
                .filter(Filter::equals(&self.schema.timestamp, scope.load_timestamp.as_str()))
                .filter(Filter::present(&relation.parent_ac))
                .fields(&[relation.parent_ac.as_str()]);

            let scanned = for_each_page(index, &query, |_, children| {
                for child in children {
                    let Some(child_id) = child.id().map(str::to_string) else { continue };
                    let mut ids = Vec::new();
                    let mut titles = Vec::new();
                    for ac in child.get(&relation.parent_ac) {
                        match self.lookup_parent(ac)? {
                            Some(parent) => {
                                self.parents.insert(parent.id.clone(), ac.clone());
                                ids.push(parent.id);
                                titles.push(parent.title);
                            }
                            None => {
                                self.stats.inc_parents_missing();
                                debug!(child = %child_id, parent_ac = %ac, "Parent not in index");
                            }
                        }
                    }
                    if ids.is_empty() {
                        continue;
                    }
                    let link = LinkDocument::new(child_id)
                        .set(&relation.parent_sys, ids)
                        .set(&relation.parent_title, titles);
                    self.buffer.push(index, &self.stats, link)?;
                }
                Ok(())
            })?;
            self.stats.add_scanned(scanned as u64);
            debug!(kind = kind.label(), children = scanned, "Children of this run linked to parents");
        }
        Ok(())
    }

    fn lookup_parent(&mut self, ac: &str) -> Result<Option<ParentRef>, IndexError> {
        if let Some(cached) = self.parent_cache.get(ac) {
            return Ok(cached.clone());
        }
        let query = Query::new(1)
            .filter(Filter::equals(&self.schema.catalog_no, ac))
            .fields(&[self.schema.title.as_str()]);
        let parent = self.index.query(&query)?.into_iter().next().and_then(|doc| {
            Some(ParentRef {
                id: doc.id()?.to_string(),
                title: doc.first(&self.schema.title).unwrap_or_default().to_string(),
            })
        });
        self.parent_cache.insert(ac.to_string(), parent.clone());
        Ok(parent)
    }

    fn unlink_stale_children(&mut self) -> Result<(), IndexError> {
        let parent_ids: Vec<String> = self.parents.keys().cloned().collect();
        for id in parent_ids {
            let link = self
                .schema
                .summary_fields()
                .iter()
                .fold(LinkDocument::new(id), |link, field| link.set(field, Vec::new()));
            self.buffer.push(self.index, &self.stats, link)?;
        }
        debug!(parents = self.parents.len(), "Child summaries cleared");
        Ok(())
    }

    fn relink_from_children(&mut self) -> Result<(), IndexError> {
        let parents: Vec<(String, String)> = self.parents.iter().map(|(id, ac)| (id.clone(), ac.clone())).collect();
        for (id, ac) in parents {
            let filters = RelationKind::ALL
                .iter()
                .map(|kind| Filter::equals(&self.schema.relation(*kind).parent_ac, ac.as_str()))
                .collect();
            let children = self.accumulate_children(&id, &ac, Filter::any_of(filters))?;
            debug!(parent = %id, children, "Child summary rebuilt");
        }
        Ok(())
    }

    fn relink_from_parents(&mut self, scope: &RelationScope) -> Result<(), IndexError> {
        let index = self.index;
        let query = Query::new(self.page_size)
            .filter(Filter::equals(&self.schema.timestamp, scope.load_timestamp.as_str()))
            .filter(Filter::not(Filter::present(&self.schema.childs_sys)))
            .fields(&[self.schema.catalog_no.as_str()]);

        let mut relinked = 0;
        let scanned = for_each_page(index, &query, |_, docs| {
            let orphans: Vec<(String, String)> = docs
                .iter()
                .filter_map(|doc| {
                    let id = doc.id()?.to_string();
                    let ac = doc.first(&self.schema.catalog_no).unwrap_or_default().to_string();
                    Some((id, ac))
                })
                .collect();
            for chunk in orphans.chunks(PARENT_LOOKUP_CHUNK) {
                relinked += self.relink_orphans(chunk)?;
            }
            Ok(())
        })?;
        self.stats.add_scanned(scanned as u64);
        debug!(orphans = scanned, relinked, "Parents without children re-examined");
        Ok(())
    }

    /// Fetches the children of a group of parents with one paginated query and
    /// writes each parent's summary. Returns how many parents got children.
    fn relink_orphans(&mut self, orphans: &[(String, String)]) -> Result<usize, IndexError> {
        let index = self.index;
        let mut filters = Vec::new();
        // parent id or catalog number -> position in `orphans`
        let mut keys: FxHashMap<(&str, &str), Vec<usize>> = FxHashMap::default();
        for kind in RelationKind::ALL {
            let relation = self.schema.relation(kind);
            for (pos, (id, ac)) in orphans.iter().enumerate() {
                filters.push(Filter::equals(&relation.parent_sys, id.as_str()));
                keys.entry((relation.parent_sys.as_str(), id.as_str())).or_default().push(pos);
                if !ac.is_empty() {
                    filters.push(Filter::equals(&relation.parent_ac, ac.as_str()));
                    keys.entry((relation.parent_ac.as_str(), ac.as_str())).or_default().push(pos);
                }
            }
        }

        let fields = self.schema.child_fields();
        let query = Query::new(self.page_size).filter(Filter::any_of(filters)).fields(&fields);
        let mut children: Vec<Vec<Document>> = vec![Vec::new(); orphans.len()];
        let found = for_each_page(index, &query, |_, docs| {
            for doc in docs {
                let mut owners: BTreeSet<usize> = BTreeSet::new();
                for (&(field, value), positions) in &keys {
                    if doc.get(field).iter().any(|v| v == value) {
                        owners.extend(positions.iter().copied());
                    }
                }
                for pos in owners {
                    children[pos].push(doc.clone());
                }
            }
            Ok(())
        })?;
        self.stats.add_scanned(found as u64);

        let mut relinked = 0;
        for ((id, ac), docs) in orphans.iter().zip(children) {
            let summary = ChildSummary::collect(&self.schema, id, ac, &docs);
            if summary.ids.is_empty() {
                continue;
            }
            let link = summary.into_link(&self.schema, id, true);
            self.buffer.push(index, &self.stats, link)?;
            relinked += 1;
        }
        Ok(relinked)
    }

    /// Rebuilds one parent's child summary from every child matching `children`.
    /// The first page replaces the lists, later pages append to them.
    fn accumulate_children(&mut self, parent_id: &str, parent_ac: &str, children: Filter) -> Result<usize, IndexError> {
        let index = self.index;
        let fields = self.schema.child_fields();
        let query = Query::new(self.page_size).filter(children).fields(&fields);

        let found = for_each_page(index, &query, |page_no, docs| {
            let summary = ChildSummary::collect(&self.schema, parent_id, parent_ac, &docs);
            let link = summary.into_link(&self.schema, parent_id, page_no == 0);
            self.buffer.push(index, &self.stats, link)
        })?;
        self.stats.add_scanned(found as u64);
        Ok(found)
    }
}

/// Parallel child lists written onto a parent.
#[derive(Debug, Default)]
struct ChildSummary {
    types: Vec<String>,
    ids: Vec<String>,
    acs: Vec<String>,
    titles: Vec<String>,
    volume_nos: Vec<String>,
    volume_sorts: Vec<String>,
    editions: Vec<String>,
    publish_dates: Vec<String>,
}

impl ChildSummary {
    fn collect(schema: &LinkSchema, parent_id: &str, parent_ac: &str, docs: &[Document]) -> Self {
        let mut summary = ChildSummary::default();
        let value = |doc: &Document, field: &str| {
            doc.first(field)
                .filter(|v| !v.is_empty())
                .unwrap_or(schema.missing_value.as_str())
                .to_string()
        };
        for doc in docs {
            let Some(id) = doc.id() else { continue };
            if id == parent_id {
                continue;
            }
            let kind = RelationKind::ALL
                .into_iter()
                .find(|kind| {
                    let relation = schema.relation(*kind);
                    doc.get(&relation.parent_sys).iter().any(|v| v == parent_id)
                        || (!parent_ac.is_empty() && doc.get(&relation.parent_ac).iter().any(|v| v == parent_ac))
                })
                .unwrap_or(RelationKind::MultiVolume);

            summary.types.push(kind.label().to_string());
            summary.ids.push(id.to_string());
            summary.acs.push(value(doc, &schema.catalog_no));
            summary.titles.push(value(doc, &schema.title));
            summary.volume_nos.push(value(doc, &schema.volume_no));
            summary.volume_sorts.push(value(doc, &schema.volume_no_sort));
            summary.editions.push(value(doc, &schema.edition));
            summary.publish_dates.push(value(doc, &schema.publish_date));
        }
        summary
    }

    fn into_link(self, schema: &LinkSchema, parent_id: &str, replace: bool) -> LinkDocument {
        let lists = [
            self.types,
            self.ids,
            self.acs,
            self.titles,
            self.volume_nos,
            self.volume_sorts,
            self.editions,
            self.publish_dates,
        ];
        schema
            .summary_fields()
            .into_iter()
            .zip(lists)
            .fold(LinkDocument::new(parent_id), |link, (field, values)| {
                if replace {
                    link.set(field, values)
                } else {
                    link.add(field, values)
                }
            })
    }
}

/// Field names for authority linking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthoritySchema {
    /// Authority number on the authority record.
    pub authority_key: String,
    /// Bibliographic fields holding cited authority numbers.
    pub bib_citation_fields: Vec<String>,
    pub exists_in_bib: String,
    pub bib_record_count: String,
    pub timestamp: String,
}

impl Default for AuthoritySchema {
    fn default() -> Self {
        Self {
            authority_key: "gndId_str".to_string(),
            bib_citation_fields: vec![
                "author_GndNo_str".to_string(),
                "author2_GndNo_str_mv".to_string(),
                "author_additional_GndNo_str_mv".to_string(),
                "subject_GndNo_str_mv".to_string(),
            ],
            exists_in_bib: "existsInBibIndex_str".to_string(),
            bib_record_count: "bibRecordCount_str".to_string(),
            timestamp: TIMESTAMP_FIELD.to_string(),
        }
    }
}

/// Writes citation flags and counts onto authority records.
pub struct AuthorityLinker<'a> {
    bib: &'a dyn IndexService,
    authority: &'a dyn IndexService,
    schema: AuthoritySchema,
    page_size: usize,
    buffer: LinkBuffer,
    stats: LinkStats,
}

impl<'a> AuthorityLinker<'a> {
    pub fn new(bib: &'a dyn IndexService, authority: &'a dyn IndexService) -> Self {
        Self::with_schema(bib, authority, AuthoritySchema::default())
    }

    pub fn with_schema(bib: &'a dyn IndexService, authority: &'a dyn IndexService, schema: AuthoritySchema) -> Self {
        Self {
            bib,
            authority,
            schema,
            page_size: QUERY_PAGE_SIZE,
            buffer: LinkBuffer::new(LINK_BATCH_SIZE),
            stats: LinkStats::new(),
        }
    }

    pub fn page_size(mut self, rows: usize) -> Self {
        self.page_size = rows.max(1);
        self
    }

    pub fn batch_size(mut self, docs: usize) -> Self {
        self.buffer = LinkBuffer::new(docs);
        self
    }

    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }

    /// Recomputes the citation fields of every authority touched by the run,
    /// either as an authority record or as a citation from a touched bib record.
    pub fn run(&mut self, scope: &RelationScope) -> LinkReport {
        let pb = make_spinner("Linking authorities");
        let mut report = LinkReport::new();

        let result = self.recount(scope);
        let result = result
            .and_then(|()| self.buffer.flush(self.authority, &self.stats))
            .and_then(|()| self.authority.commit());
        let ok = match result {
            Ok(()) => true,
            Err(e) => {
                let dropped = self.buffer.discard();
                self.stats.inc_failed_phases();
                error!(error = %e, dropped, "Authority linking abandoned");
                false
            }
        };
        report.record(Phase::AuthorityCounts, ok);

        pb.finish_and_clear();
        info!(stats = %self.stats, success = ok, "Authority linking finished");
        report
    }

    fn recount(&mut self, scope: &RelationScope) -> Result<(), IndexError> {
        let keys = self.touched_keys(scope)?;
        info!(authorities = keys.len(), "Authorities to recount");

        let authority = self.authority;
        for key in keys {
            let count = self.citation_count(&key)?;
            let query = Query::new(self.page_size)
                .filter(Filter::equals(&self.schema.authority_key, key.as_str()))
                .fields(&[]);
            let exists = if count > 0 { "true" } else { "false" };

            for_each_page(authority, &query, |_, docs| {
                for doc in docs {
                    let Some(id) = doc.id() else { continue };
                    let link = LinkDocument::new(id)
                        .set(&self.schema.exists_in_bib, vec![exists.to_string()])
                        .set(&self.schema.bib_record_count, vec![count.to_string()]);
                    self.buffer.push(authority, &self.stats, link)?;
                }
                Ok(())
            })?;
        }
        Ok(())
    }

    /// Authority numbers of authorities loaded in this run plus those cited by
    /// bib records loaded in this run.
    fn touched_keys(&self, scope: &RelationScope) -> Result<BTreeSet<String>, IndexError> {
        let mut keys = BTreeSet::new();

        let authorities = Query::new(self.page_size)
            .filter(Filter::equals(&self.schema.timestamp, scope.load_timestamp.as_str()))
            .fields(&[self.schema.authority_key.as_str()]);
        let scanned = for_each_page(self.authority, &authorities, |_, docs| {
            for doc in docs {
                keys.extend(doc.get(&self.schema.authority_key).iter().cloned());
            }
            Ok(())
        })?;
        self.stats.add_scanned(scanned as u64);

        let citing: Vec<&str> = self.schema.bib_citation_fields.iter().map(String::as_str).collect();
        let bibs = Query::new(self.page_size)
            .filter(Filter::equals(&self.schema.timestamp, scope.load_timestamp.as_str()))
            .fields(&citing);
        let scanned = for_each_page(self.bib, &bibs, |_, docs| {
            for doc in docs {
                for field in &self.schema.bib_citation_fields {
                    keys.extend(doc.get(field).iter().cloned());
                }
            }
            Ok(())
        })?;
        self.stats.add_scanned(scanned as u64);

        keys.retain(|k| !k.trim().is_empty());
        Ok(keys)
    }

    /// Number of distinct bib records citing `key` in any citation field.
    fn citation_count(&self, key: &str) -> Result<usize, IndexError> {
        let filters = self
            .schema
            .bib_citation_fields
            .iter()
            .map(|field| Filter::equals(field, key))
            .collect();
        let query = Query::new(self.page_size).filter(Filter::any_of(filters)).fields(&[]);
        let mut ids = FxHashSet::default();
        for_each_page(self.bib, &query, |_, docs| {
            ids.extend(docs.iter().filter_map(|d| d.id().map(str::to_string)));
            Ok(())
        })?;
        Ok(ids.len())
    }
}
