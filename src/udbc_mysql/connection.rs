use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, Row as MyRow};

use crate::error::DbError;
use crate::udbc::connection::Connection;
use crate::udbc::value::{QueryResult, Row, Value};
use crate::udbc_mysql::value_codec::{from_mysql_value, to_mysql_value};

pub struct MysqlConnection {
    conn: Option<Conn>,
}

impl MysqlConnection {
    pub fn new(conn: Conn) -> Self {
        Self { conn: Some(conn) }
    }

    fn map_row(row: MyRow) -> Row {
        let cols = row.columns_ref();
        (0..row.len())
            .map(|i| {
                let name = cols
                    .get(i)
                    .map(|c| c.name_str().to_string())
                    .unwrap_or_else(|| i.to_string());
                let value = row.as_ref(i).map(from_mysql_value).unwrap_or(Value::Null);
                (name, value)
            })
            .collect()
    }

    fn conn(&mut self) -> Result<&mut Conn, DbError> {
        self.conn
            .as_mut()
            .ok_or_else(|| DbError::Connection("mysql connection already released".into()))
    }
}

#[async_trait]
impl Connection for MysqlConnection {
    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult, DbError> {
        let conn = self.conn()?;
        let rows: Vec<MyRow> = if params.is_empty() {
            conn.query(sql).await?
        } else {
            let params =
                mysql_async::Params::Positional(params.iter().map(to_mysql_value).collect());
            conn.exec(sql, params).await?
        };
        Ok(QueryResult {
            rows: rows.into_iter().map(Self::map_row).collect(),
            affected_rows: conn.affected_rows(),
        })
    }

    async fn release(&mut self) -> Result<(), DbError> {
        // Dropping a mysql_async Conn hands it back to the driver's pool.
        self.conn.take();
        Ok(())
    }
}
