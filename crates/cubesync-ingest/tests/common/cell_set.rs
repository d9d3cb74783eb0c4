//! XMLA `Execute` response builder shared by the parser unit tests and the
//! integration tests

/// Build a multidimensional cell set with `measures` on Axis0, one tuple of
/// `(hierarchy, caption)` members per row on Axis1, and `(ordinal, value)`
/// cells.
pub fn cell_set_xml(
    measures: &[&str],
    rows: &[Vec<(&str, &str)>],
    cells: &[(usize, &str)],
) -> String {
    let mut xml = String::from(
        r#"<?xml version="1.0" encoding="utf-8"?>
<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
<soap:Body><ExecuteResponse xmlns="urn:schemas-microsoft-com:xml-analysis"><return>
<root xmlns="urn:schemas-microsoft-com:xml-analysis:mddataset" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">
<OlapInfo><AxesInfo><AxisInfo name="Axis0"/><AxisInfo name="Axis1"/></AxesInfo></OlapInfo>
<Axes><Axis name="Axis0"><Tuples>"#,
    );
    for measure in measures {
        xml.push_str(&format!(
            r#"<Tuple><Member Hierarchy="[Measures]"><UName>[Measures].[{m}]</UName><Caption>{m}</Caption><LNum>0</LNum></Member></Tuple>"#,
            m = measure
        ));
    }
    xml.push_str(r#"</Tuples></Axis><Axis name="Axis1"><Tuples>"#);
    for row in rows {
        xml.push_str("<Tuple>");
        for (hierarchy, caption) in row {
            xml.push_str(&format!(
                r#"<Member Hierarchy="{h}"><UName>{h}.&amp;[{c}]</UName><Caption>{c}</Caption></Member>"#,
                h = hierarchy,
                c = caption
            ));
        }
        xml.push_str("</Tuple>");
    }
    xml.push_str(r#"</Tuples></Axis><Axis name="SlicerAxis"><Tuples><Tuple><Member Hierarchy="[Calendar].[MyView]"><Caption>Last 7 Days</Caption></Member></Tuple></Tuples></Axis></Axes><CellData>"#);
    for (ordinal, value) in cells {
        xml.push_str(&format!(
            r#"<Cell CellOrdinal="{}"><Value xsi:type="xsd:double">{}</Value><FmtValue>{}</FmtValue></Cell>"#,
            ordinal, value, value
        ));
    }
    xml.push_str("</CellData></root></return></ExecuteResponse></soap:Body></soap:Envelope>");
    xml
}
