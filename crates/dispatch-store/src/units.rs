/// Unit tags and the call↔unit join. `(unit_type, unit_number)` is
/// unique; missing tags are created on demand by the unit tagger.
use rusqlite::{params, OptionalExtension, Row};

use dispatch_protocol::call::UnitTag;
use dispatch_protocol::units::UnitType;

use crate::{CallStore, Result};

impl CallStore {
    pub fn get_or_create_unit(&self, unit_type: UnitType, unit_number: u16) -> Result<UnitTag> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO unit_tags
                 (unit_type, unit_number, display_name, color, active)
                 VALUES (?1, ?2, ?3, ?4, 1)",
                params![
                    unit_type.as_str(),
                    unit_number,
                    UnitTag::display_name_for(unit_type, unit_number),
                    unit_type.default_color(),
                ],
            )?;
            let tag = conn.query_row(
                "SELECT id, unit_type, unit_number, display_name, color, active
                 FROM unit_tags WHERE unit_type = ?1 AND unit_number = ?2",
                params![unit_type.as_str(), unit_number],
                row_to_unit,
            )?;
            Ok(tag)
        })
    }

    pub fn get_unit(&self, unit_type: UnitType, unit_number: u16) -> Result<Option<UnitTag>> {
        self.with_conn(|conn| {
            let tag = conn
                .query_row(
                    "SELECT id, unit_type, unit_number, display_name, color, active
                     FROM unit_tags WHERE unit_type = ?1 AND unit_number = ?2",
                    params![unit_type.as_str(), unit_number],
                    row_to_unit,
                )
                .optional()?;
            Ok(tag)
        })
    }

    pub fn attach_unit(&self, call_id: i64, unit_tag_id: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO call_units (call_id, unit_tag_id) VALUES (?1, ?2)",
                params![call_id, unit_tag_id],
            )?;
            Ok(())
        })
    }

    pub fn units_for_call(&self, call_id: i64) -> Result<Vec<UnitTag>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT u.id, u.unit_type, u.unit_number, u.display_name, u.color, u.active
                 FROM unit_tags u
                 JOIN call_units cu ON cu.unit_tag_id = u.id
                 WHERE cu.call_id = ?1
                 ORDER BY u.unit_type, u.unit_number",
            )?;
            let rows = stmt.query_map(params![call_id], row_to_unit)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }
}

fn row_to_unit(row: &Row<'_>) -> rusqlite::Result<UnitTag> {
    let type_str: String = row.get(1)?;
    Ok(UnitTag {
        id: row.get(0)?,
        unit_type: UnitType::parse(&type_str).unwrap_or(UnitType::Ems),
        unit_number: row.get(2)?,
        display_name: row.get(3)?,
        color: row.get(4)?,
        active: row.get(5)?,
    })
}
