use crate::footprint::Footprint;
use crate::geom::Point2D;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::marker::PhantomData;
use std::path::Path;

/// Storage type of a catalog field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    Flag,
    Int,
    Double,
    Point,
}

impl FieldType {
    /// Value a freshly added record carries. Floating fields start as NaN so
    /// an unset measurement is never mistaken for a real zero.
    pub fn default_value(self) -> FieldValue {
        match self {
            FieldType::Flag => FieldValue::Flag(false),
            FieldType::Int => FieldValue::Int(0),
            FieldType::Double => FieldValue::Double(f64::NAN),
            FieldType::Point => FieldValue::Point([f64::NAN, f64::NAN]),
        }
    }
}

/// A single field value as stored in a record
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Flag(bool),
    Int(i32),
    Double(f64),
    Point([f64; 2]),
}

impl FieldValue {
    pub fn field_type(&self) -> FieldType {
        match self {
            FieldValue::Flag(_) => FieldType::Flag,
            FieldValue::Int(_) => FieldType::Int,
            FieldValue::Double(_) => FieldType::Double,
            FieldValue::Point(_) => FieldType::Point,
        }
    }

    /// Non-finite floating values mean "unset" and are left out of
    /// serialized rows; JSON has no representation for them.
    pub fn is_set(&self) -> bool {
        match self {
            FieldValue::Double(v) => v.is_finite(),
            FieldValue::Point([x, y]) => x.is_finite() && y.is_finite(),
            _ => true,
        }
    }

    /// Convert to `target`, allowing the lossless numeric widenings JSON
    /// input needs (an integer literal in a double column)
    fn coerce(self, target: FieldType) -> Option<FieldValue> {
        match (self, target) {
            (v, t) if v.field_type() == t => Some(v),
            (FieldValue::Int(i), FieldType::Double) => Some(FieldValue::Double(i as f64)),
            _ => None,
        }
    }
}

/// Rust types that can be stored in a catalog field
pub trait FieldKind: Copy {
    const TYPE: FieldType;

    fn into_value(self) -> FieldValue;
    fn from_value(value: &FieldValue) -> Option<Self>;

    /// Value of a field that was never set
    fn unset() -> Self;
}

impl FieldKind for bool {
    const TYPE: FieldType = FieldType::Flag;

    fn into_value(self) -> FieldValue {
        FieldValue::Flag(self)
    }

    fn from_value(value: &FieldValue) -> Option<Self> {
        match value {
            FieldValue::Flag(v) => Some(*v),
            _ => None,
        }
    }

    fn unset() -> Self {
        false
    }
}

impl FieldKind for i32 {
    const TYPE: FieldType = FieldType::Int;

    fn into_value(self) -> FieldValue {
        FieldValue::Int(self)
    }

    fn from_value(value: &FieldValue) -> Option<Self> {
        match value {
            FieldValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    fn unset() -> Self {
        0
    }
}

impl FieldKind for f64 {
    const TYPE: FieldType = FieldType::Double;

    fn into_value(self) -> FieldValue {
        FieldValue::Double(self)
    }

    fn from_value(value: &FieldValue) -> Option<Self> {
        match value {
            FieldValue::Double(v) => Some(*v),
            _ => None,
        }
    }

    fn unset() -> Self {
        f64::NAN
    }
}

impl FieldKind for Point2D {
    const TYPE: FieldType = FieldType::Point;

    fn into_value(self) -> FieldValue {
        FieldValue::Point([self.x, self.y])
    }

    fn from_value(value: &FieldValue) -> Option<Self> {
        match value {
            FieldValue::Point([x, y]) => Some(Point2D::new(*x, *y)),
            _ => None,
        }
    }

    fn unset() -> Self {
        Point2D::new(f64::NAN, f64::NAN)
    }
}

/// Typed handle to a registered field
#[derive(Debug)]
pub struct Key<T> {
    index: usize,
    _marker: PhantomData<T>,
}

impl<T> Clone for Key<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Key<T> {}

impl<T> Key<T> {
    pub fn index(&self) -> usize {
        self.index
    }
}

/// Registered field: name, type and description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    pub doc: String,
}

/// Ordered set of fields every record in a catalog carries
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    fields: Vec<FieldDef>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new field. Names must be unique.
    pub fn add_field<T: FieldKind>(&mut self, name: &str, doc: &str) -> Result<Key<T>> {
        let index = self.add_field_dyn(name, T::TYPE, doc)?;
        Ok(Key {
            index,
            _marker: PhantomData,
        })
    }

    pub(crate) fn add_field_dyn(
        &mut self,
        name: &str,
        field_type: FieldType,
        doc: &str,
    ) -> Result<usize> {
        if self.position(name).is_some() {
            return Err(anyhow::anyhow!("Field '{}' already exists in schema", name));
        }
        self.fields.push(FieldDef {
            name: name.to_string(),
            field_type,
            doc: doc.to_string(),
        });
        Ok(self.fields.len() - 1)
    }

    /// Look up an existing field, checking its type
    pub fn find<T: FieldKind>(&self, name: &str) -> Result<Key<T>> {
        let index = self
            .position(name)
            .ok_or_else(|| anyhow::anyhow!("Field '{}' not found in schema", name))?;
        let actual = self.fields[index].field_type;
        if actual != T::TYPE {
            return Err(anyhow::anyhow!(
                "Field '{}' has type {:?}, expected {:?}",
                name,
                actual,
                T::TYPE
            ));
        }
        Ok(Key {
            index,
            _marker: PhantomData,
        })
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    fn default_values(&self) -> Vec<FieldValue> {
        self.fields.iter().map(|f| f.field_type.default_value()).collect()
    }
}

/// One detection in the catalog
#[derive(Debug, Clone)]
pub struct SourceRecord {
    id: i64,
    parent: Option<i64>,
    footprint: Footprint,
    values: Vec<FieldValue>,
}

impl SourceRecord {
    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn parent(&self) -> Option<i64> {
        self.parent
    }

    pub fn set_parent(&mut self, parent: i64) {
        self.parent = Some(parent);
    }

    pub fn footprint(&self) -> &Footprint {
        &self.footprint
    }

    pub fn set_footprint(&mut self, footprint: Footprint) {
        self.footprint = footprint;
    }

    pub fn get<T: FieldKind>(&self, key: Key<T>) -> T {
        // Keys only come from the schema this record was built with, so the
        // stored variant matches T.
        self.values
            .get(key.index)
            .and_then(T::from_value)
            .unwrap_or_else(T::unset)
    }

    pub fn set<T: FieldKind>(&mut self, key: Key<T>, value: T) {
        self.values[key.index] = value.into_value();
    }

    pub fn value(&self, index: usize) -> Option<&FieldValue> {
        self.values.get(index)
    }
}

/// Append-only catalog of detections with monotonically assigned ids.
///
/// Rows are never removed or reordered; positional indices stay stable for
/// the lifetime of the catalog.
#[derive(Debug, Clone)]
pub struct SourceCatalog {
    schema: Schema,
    records: Vec<SourceRecord>,
    next_id: i64,
}

impl SourceCatalog {
    pub fn new(schema: Schema) -> Self {
        Self {
            schema,
            records: Vec::new(),
            next_id: 1,
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&SourceRecord> {
        self.records.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut SourceRecord> {
        self.records.get_mut(index)
    }

    pub fn records(&self) -> &[SourceRecord] {
        &self.records
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SourceRecord> {
        self.records.iter()
    }

    /// Id the next appended record will receive
    pub fn next_id(&self) -> i64 {
        self.next_id
    }

    /// Append a record with a fresh id and default field values
    pub fn add_new(&mut self) -> &mut SourceRecord {
        let id = self.next_id;
        self.push_record(id, None, Footprint::default())
    }

    /// Append a record with an externally assigned id, which must exceed
    /// every id already present
    pub fn add_with_id(
        &mut self,
        id: i64,
        parent: Option<i64>,
        footprint: Footprint,
    ) -> Result<&mut SourceRecord> {
        if id < self.next_id {
            return Err(anyhow::anyhow!(
                "Record id {} is not greater than existing ids (next id is {})",
                id,
                self.next_id
            ));
        }
        Ok(self.push_record(id, parent, footprint))
    }

    pub fn find_by_id(&self, id: i64) -> Option<&SourceRecord> {
        // Ids are increasing in append order
        self.records
            .binary_search_by_key(&id, |r| r.id)
            .ok()
            .map(|i| &self.records[i])
    }

    pub fn children_of(&self, parent_id: i64) -> impl Iterator<Item = &SourceRecord> + '_ {
        self.records
            .iter()
            .filter(move |r| r.parent == Some(parent_id))
    }

    fn push_record(&mut self, id: i64, parent: Option<i64>, footprint: Footprint) -> &mut SourceRecord {
        self.next_id = id + 1;
        self.records.push(SourceRecord {
            id,
            parent,
            footprint,
            values: self.schema.default_values(),
        });
        let last = self.records.len() - 1;
        &mut self.records[last]
    }

    /// Serializable form of every record, fields keyed by name
    pub fn to_rows(&self) -> Vec<SourceRow> {
        self.records
            .iter()
            .map(|record| SourceRow {
                id: record.id,
                parent: record.parent,
                footprint: record.footprint.clone(),
                fields: self
                    .schema
                    .fields
                    .iter()
                    .zip(&record.values)
                    .filter(|(_, value)| value.is_set())
                    .map(|(def, value)| (def.name.clone(), *value))
                    .collect(),
            })
            .collect()
    }

    /// Build a catalog from rows. Fields present in the rows but absent from
    /// `schema` are registered in order of first occurrence, as `Double` when
    /// any row holds a float for a field that otherwise looks like `Int`.
    pub fn from_rows(mut schema: Schema, rows: Vec<SourceRow>) -> Result<Self> {
        let mut inferred: Vec<(&str, FieldType)> = Vec::new();
        for row in &rows {
            for (name, value) in &row.fields {
                if schema.position(name).is_some() {
                    continue;
                }
                let seen = value.field_type();
                match inferred.iter_mut().find(|(n, _)| *n == name.as_str()) {
                    Some((_, ty @ FieldType::Int)) if seen == FieldType::Double => {
                        *ty = FieldType::Double;
                    }
                    Some(_) => {}
                    None => inferred.push((name.as_str(), seen)),
                }
            }
        }
        for (name, field_type) in inferred {
            schema.add_field_dyn(name, field_type, "")?;
        }

        let mut catalog = Self::new(schema);
        for row in rows {
            let footprint = row
                .footprint
                .normalize()
                .with_context(|| format!("Invalid footprint for source {}", row.id))?;
            catalog.add_with_id(row.id, row.parent, footprint)?;

            let SourceCatalog {
                schema, records, ..
            } = &mut catalog;
            let record = records
                .last_mut()
                .ok_or_else(|| anyhow::anyhow!("Record {} was not appended", row.id))?;
            for (name, value) in row.fields {
                let index = schema
                    .position(&name)
                    .ok_or_else(|| anyhow::anyhow!("Field '{}' missing from schema", name))?;
                let target = schema.fields[index].field_type;
                record.values[index] = value.coerce(target).ok_or_else(|| {
                    anyhow::anyhow!(
                        "Source {}: field '{}' expects {:?}, got {:?}",
                        row.id,
                        name,
                        target,
                        value
                    )
                })?;
            }
        }

        Ok(catalog)
    }

    /// Load a catalog written by [`SourceCatalog::save_json`] or produced by
    /// the detection stage. Fields declared in the file's schema are merged
    /// into `schema`.
    pub fn load_json(mut schema: Schema, path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open catalog: {}", path.display()))?;
        let parsed: CatalogFile = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse catalog: {}", path.display()))?;

        for def in parsed.schema.iter().flat_map(|s| s.fields()) {
            match schema.position(&def.name) {
                Some(i) if schema.fields[i].field_type != def.field_type => {
                    return Err(anyhow::anyhow!(
                        "Field '{}' is {:?} in {} but {:?} in the schema",
                        def.name,
                        def.field_type,
                        path.display(),
                        schema.fields[i].field_type
                    ));
                }
                Some(_) => {}
                None => {
                    schema.add_field_dyn(&def.name, def.field_type, &def.doc)?;
                }
            }
        }

        Self::from_rows(schema, parsed.sources)
    }

    pub fn save_json(&self, path: &Path) -> Result<()> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create catalog: {}", path.display()))?;
        let out = CatalogFile {
            schema: Some(self.schema.clone()),
            sources: self.to_rows(),
        };
        serde_json::to_writer_pretty(BufWriter::new(file), &out)?;
        Ok(())
    }
}

/// On-disk catalog layout
#[derive(Debug, Serialize, Deserialize)]
pub struct CatalogFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Schema>,
    pub sources: Vec<SourceRow>,
}

/// One record in serialized form
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRow {
    pub id: i64,
    #[serde(default)]
    pub parent: Option<i64>,
    pub footprint: Footprint,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,
}
