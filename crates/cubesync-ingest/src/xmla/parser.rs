//! Multidimensional cell set parser
//!
//! Turns an XMLA `Execute` response (`Format=Multidimensional`) into flat
//! rows. The column axis (`Axis0`) carries measure captions, the row axis
//! (`Axis1`) carries one tuple of dimension members per row, and `CellData`
//! holds the values addressed by ordinal:
//!
//! ```text
//! ordinal = row_index * measure_count + measure_index
//! ```
//!
//! Cells the cube did not return (NON EMPTY filtering) come out as nulls.

use cubesync_common::types::{CellValue, Row};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

use super::hierarchy::{HierarchyMapper, HierarchyRule};
use crate::error::{IngestError, Result};

const COLUMN_AXIS: &str = "Axis0";
const ROW_AXIS: &str = "Axis1";

/// Row-axis member: hierarchy unique name plus its caption
#[derive(Debug, Clone, PartialEq)]
struct Member {
    hierarchy: String,
    caption: CellValue,
}

/// Raw pieces of a cell set before ordinal reconstruction
#[derive(Debug, Default)]
struct RawCellSet {
    measures: Vec<String>,
    rows: Vec<Vec<Member>>,
    cells: HashMap<usize, CellValue>,
    saw_column_axis: bool,
    fault: Option<String>,
}

/// Config-driven parser for one pipeline's cube responses
#[derive(Debug, Clone)]
pub struct CellSetParser {
    mapper: HierarchyMapper,
}

impl CellSetParser {
    pub fn new(mapper: HierarchyMapper) -> Self {
        Self { mapper }
    }

    pub fn from_rules(rules: &[HierarchyRule]) -> Result<Self> {
        Ok(Self::new(HierarchyMapper::new(rules)?))
    }

    /// Parse a response body into rows, preserving row-axis order.
    pub fn parse(&self, xml: &str) -> Result<Vec<Row>> {
        let raw = read_cell_set(xml)?;

        if let Some(fault) = raw.fault {
            return Err(IngestError::QueryFault(fault));
        }
        if !raw.saw_column_axis {
            return Err(IngestError::malformed("response has no Axis0 (measures) axis"));
        }
        if raw.measures.is_empty() {
            return Err(IngestError::malformed("no measures found on Axis0"));
        }

        info!(
            measures = raw.measures.len(),
            rows = raw.rows.len(),
            cells = raw.cells.len(),
            "Parsed cell set"
        );

        if raw.rows.is_empty() {
            warn!("Cube response has no row tuples on Axis1");
            return Ok(Vec::new());
        }

        Ok(self.assemble(raw))
    }

    fn assemble(&self, raw: RawCellSet) -> Vec<Row> {
        let RawCellSet {
            measures,
            rows,
            mut cells,
            ..
        } = raw;
        let measure_count = measures.len();
        let mut unmapped: HashSet<String> = HashSet::new();
        let mut out = Vec::with_capacity(rows.len());

        for (row_index, members) in rows.into_iter().enumerate() {
            let mut row = Row::with_capacity(members.len() + measure_count);

            for member in members {
                let field = match self.mapper.resolve(&member.hierarchy) {
                    Some(field) => field.to_string(),
                    None => {
                        if unmapped.insert(member.hierarchy.clone()) {
                            warn!(
                                hierarchy = %member.hierarchy,
                                "No hierarchy mapping configured, keeping raw name"
                            );
                        }
                        member.hierarchy
                    },
                };
                row.insert(field, member.caption);
            }

            for (measure_index, measure) in measures.iter().enumerate() {
                let ordinal = row_index * measure_count + measure_index;
                let value = cells.remove(&ordinal).unwrap_or(CellValue::Null);
                row.insert(measure.clone(), value);
            }

            out.push(row);
        }

        if !cells.is_empty() {
            debug!(
                ignored = cells.len(),
                "Cells with ordinals outside the row x measure grid were ignored"
            );
        }

        out
    }
}

fn attribute(element: &BytesStart<'_>, name: &str) -> Result<Option<String>> {
    let attr = element
        .try_get_attribute(name)
        .map_err(|e| IngestError::malformed(format!("bad attribute '{}': {}", name, e)))?;
    match attr {
        Some(attr) => Ok(Some(attr.unescape_value()?.into_owned())),
        None => Ok(None),
    }
}

/// Mutable cursor over the event stream
#[derive(Default)]
struct ReadState {
    axis: Option<String>,
    tuple: Option<Vec<Member>>,
    member: Option<Member>,
    cell_ordinal: Option<usize>,
    text: String,
}

impl ReadState {
    fn on_start(&mut self, element: &BytesStart<'_>, out: &mut RawCellSet) -> Result<()> {
        self.text.clear();
        match element.local_name().as_ref() {
            b"Axis" => {
                let name = attribute(element, "name")?;
                if name.as_deref() == Some(COLUMN_AXIS) {
                    out.saw_column_axis = true;
                }
                self.axis = name;
            },
            b"Tuple" if self.axis.is_some() => {
                self.tuple = Some(Vec::new());
            },
            b"Member" if self.tuple.is_some() => {
                self.member = Some(Member {
                    hierarchy: attribute(element, "Hierarchy")?.unwrap_or_default(),
                    caption: CellValue::Null,
                });
            },
            b"Cell" => {
                let ordinal = attribute(element, "CellOrdinal")?.ok_or_else(|| {
                    IngestError::malformed("Cell element without CellOrdinal")
                })?;
                let ordinal = ordinal.trim().parse::<usize>().map_err(|_| {
                    IngestError::malformed(format!("invalid CellOrdinal '{}'", ordinal))
                })?;
                self.cell_ordinal = Some(ordinal);
            },
            b"Error" => {
                if let Some(description) = attribute(element, "Description")? {
                    out.fault.get_or_insert(description);
                }
            },
            _ => {},
        }
        Ok(())
    }

    fn on_end(&mut self, local_name: &[u8], out: &mut RawCellSet) -> Result<()> {
        match local_name {
            b"Axis" => {
                self.axis = None;
            },
            b"Tuple" => {
                if let Some(tuple) = self.tuple.take() {
                    self.finish_tuple(tuple, out)?;
                }
            },
            b"Member" => {
                if let (Some(member), Some(tuple)) = (self.member.take(), self.tuple.as_mut()) {
                    tuple.push(member);
                }
            },
            b"Caption" => {
                if let Some(member) = self.member.as_mut() {
                    let caption = std::mem::take(&mut self.text);
                    member.caption = if caption.is_empty() {
                        CellValue::Null
                    } else {
                        CellValue::Text(caption)
                    };
                }
            },
            b"Value" => {
                if let Some(ordinal) = self.cell_ordinal {
                    out.cells
                        .insert(ordinal, CellValue::from_cell_text(&self.text));
                }
            },
            b"Cell" => {
                self.cell_ordinal = None;
            },
            b"faultstring" => {
                let message = std::mem::take(&mut self.text);
                out.fault.get_or_insert(message);
            },
            _ => {},
        }
        Ok(())
    }

    fn finish_tuple(&self, tuple: Vec<Member>, out: &mut RawCellSet) -> Result<()> {
        match self.axis.as_deref() {
            Some(COLUMN_AXIS) => {
                for member in tuple {
                    match member.caption.as_text() {
                        Some(caption) => out.measures.push(caption.into_owned()),
                        None => {
                            return Err(IngestError::malformed(format!(
                                "measure member '{}' has no caption",
                                member.hierarchy
                            )))
                        },
                    }
                }
            },
            Some(ROW_AXIS) => out.rows.push(tuple),
            _ => {},
        }
        Ok(())
    }
}

fn read_cell_set(xml: &str) -> Result<RawCellSet> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut state = ReadState::default();
    let mut out = RawCellSet::default();

    loop {
        match reader.read_event()? {
            Event::Start(e) => state.on_start(&e, &mut out)?,
            Event::Empty(e) => {
                state.on_start(&e, &mut out)?;
                state.on_end(e.local_name().as_ref(), &mut out)?;
            },
            Event::End(e) => state.on_end(e.local_name().as_ref(), &mut out)?,
            Event::Text(t) => state.text.push_str(&t.unescape()?),
            Event::CData(c) => state.text.push_str(&String::from_utf8_lossy(&c)),
            Event::Eof => break,
            _ => {},
        }
    }

    Ok(out)
}

#[cfg(test)]
#[path = "../../tests/common/cell_set.rs"]
mod cell_set;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::cell_set::cell_set_xml;
    use super::*;
    use proptest::prelude::*;

    fn store_parser() -> CellSetParser {
        CellSetParser::from_rules(&[
            HierarchyRule::new("Franchise.*Store", "StoreNumber"),
            HierarchyRule::new("Calendar.*Date", "CalendarDate"),
        ])
        .unwrap()
    }

    const STORE: &str = "[Franchise].[Franchise Store]";
    const DATE: &str = "[Calendar].[Calendar Date]";

    #[test]
    fn test_parse_maps_cells_by_ordinal() {
        let xml = cell_set_xml(
            &["TY Net Sales USD", "TY Guest Count"],
            &[
                vec![(STORE, "1042"), (DATE, "11/5/25")],
                vec![(STORE, "1043"), (DATE, "11/5/25")],
            ],
            &[
                (0, "100.5"),
                (1, "12"),
                (2, "200"),
                (3, "34"),
            ],
        );

        let rows = store_parser().parse(&xml).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("StoreNumber"), Some(&CellValue::text("1042")));
        assert_eq!(rows[0].get("CalendarDate"), Some(&CellValue::text("11/5/25")));
        assert_eq!(rows[0].get("TY Net Sales USD"), Some(&CellValue::Number(100.5)));
        assert_eq!(rows[0].get("TY Guest Count"), Some(&CellValue::Number(12.0)));
        assert_eq!(rows[1].get("StoreNumber"), Some(&CellValue::text("1043")));
        assert_eq!(rows[1].get("TY Net Sales USD"), Some(&CellValue::Number(200.0)));
        assert_eq!(rows[1].get("TY Guest Count"), Some(&CellValue::Number(34.0)));
    }

    #[test]
    fn test_missing_cell_is_null() {
        let xml = cell_set_xml(
            &["Sales", "Guests"],
            &[vec![(STORE, "1")], vec![(STORE, "2")]],
            &[(0, "1"), (1, "2"), (2, "3")],
        );
        let rows = store_parser().parse(&xml).unwrap();
        assert_eq!(rows[1].get("Sales"), Some(&CellValue::Number(3.0)));
        assert_eq!(rows[1].get("Guests"), Some(&CellValue::Null));
    }

    #[test]
    fn test_unmapped_hierarchy_keeps_raw_name() {
        let xml = cell_set_xml(
            &["Sales"],
            &[vec![("[Promo].[Promo Code]", "SUMMER")]],
            &[(0, "5")],
        );
        let rows = store_parser().parse(&xml).unwrap();
        assert_eq!(
            rows[0].get("[Promo].[Promo Code]"),
            Some(&CellValue::text("SUMMER"))
        );
    }

    #[test]
    fn test_non_numeric_value_kept_as_text() {
        let xml = cell_set_xml(&["Status"], &[vec![(STORE, "1")]], &[(0, "Open")]);
        let rows = store_parser().parse(&xml).unwrap();
        assert_eq!(rows[0].get("Status"), Some(&CellValue::text("Open")));
    }

    #[test]
    fn test_empty_measures_is_malformed() {
        let xml = cell_set_xml(&[], &[vec![(STORE, "1")]], &[]);
        let err = store_parser().parse(&xml).unwrap_err();
        assert!(matches!(err, IngestError::MalformedResponse(_)));
    }

    #[test]
    fn test_missing_axes_is_malformed() {
        let err = store_parser().parse("<root><CellData/></root>").unwrap_err();
        assert!(matches!(err, IngestError::MalformedResponse(_)));
    }

    #[test]
    fn test_invalid_xml_is_malformed() {
        let err = store_parser()
            .parse("<root><Axes><Axis name=\"Axis0\"></Axes></root>")
            .unwrap_err();
        assert!(matches!(err, IngestError::MalformedResponse(_)));
    }

    #[test]
    fn test_bad_cell_ordinal_is_malformed() {
        let xml = cell_set_xml(&["Sales"], &[vec![(STORE, "1")]], &[])
            .replace("<CellData>", r#"<CellData><Cell CellOrdinal="x"><Value>1</Value></Cell>"#);
        let err = store_parser().parse(&xml).unwrap_err();
        assert!(matches!(err, IngestError::MalformedResponse(_)));
    }

    #[test]
    fn test_no_rows_is_empty_result() {
        let xml = cell_set_xml(&["Sales"], &[], &[]);
        assert!(store_parser().parse(&xml).unwrap().is_empty());
    }

    #[test]
    fn test_soap_fault_is_query_fault() {
        let xml = r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body>
            <soap:Fault><faultcode>XMLAnalysisError.0xc10a0004</faultcode>
            <faultstring>Query (1, 8) The MEASURES dimension contains more than one hierarchy.</faultstring>
            </soap:Fault></soap:Body></soap:Envelope>"#;
        match store_parser().parse(xml).unwrap_err() {
            IngestError::QueryFault(msg) => assert!(msg.contains("MEASURES")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_xmla_error_message_is_query_fault() {
        let xml = r#"<root xmlns="urn:schemas-microsoft-com:xml-analysis:mddataset"><Messages>
            <Error ErrorCode="3238658052" Description="Member not found: [Calendar].[MyView].&amp;[99]" Source="Server"/>
            </Messages></root>"#;
        match store_parser().parse(xml).unwrap_err() {
            IngestError::QueryFault(msg) => assert!(msg.contains("Member not found")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_out_of_grid_cells_are_ignored() {
        let xml = cell_set_xml(&["Sales"], &[vec![(STORE, "1")]], &[(0, "1"), (7, "9")]);
        let rows = store_parser().parse(&xml).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].len(), 2);
    }

    fn grid_strategy() -> impl Strategy<Value = (usize, usize, Vec<usize>)> {
        (1usize..6, 1usize..5).prop_flat_map(|(r, m)| {
            let ordinals: Vec<usize> = (0..r * m).collect();
            (Just(r), Just(m), Just(ordinals).prop_shuffle())
        })
    }

    proptest! {
        #[test]
        fn prop_every_ordinal_lands_on_its_row_and_measure((r, m, order) in grid_strategy()) {
            let measures: Vec<String> = (0..m).map(|i| format!("M{}", i)).collect();
            let measure_refs: Vec<&str> = measures.iter().map(String::as_str).collect();
            let captions: Vec<String> = (0..r).map(|i| format!("S{}", i)).collect();
            let rows: Vec<Vec<(&str, &str)>> =
                captions.iter().map(|c| vec![(STORE, c.as_str())]).collect();
            let values: Vec<(usize, String)> =
                order.iter().map(|o| (*o, o.to_string())).collect();
            let cells: Vec<(usize, &str)> =
                values.iter().map(|(o, v)| (*o, v.as_str())).collect();

            let parsed = store_parser()
                .parse(&cell_set_xml(&measure_refs, &rows, &cells))
                .unwrap();

            prop_assert_eq!(parsed.len(), r);
            for (ri, row) in parsed.iter().enumerate() {
                prop_assert_eq!(row.get("StoreNumber"), Some(&CellValue::Text(format!("S{}", ri))));
                for (mi, name) in measures.iter().enumerate() {
                    prop_assert_eq!(row.get(name), Some(&CellValue::Number((ri * m + mi) as f64)));
                }
            }
        }
    }
}
