use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use tracing::info;

use super::{
    fsutil, run_script, run_script_best_effort, take_bool, take_settings, take_string,
};
use crate::context::{InstallContext, require};
use crate::detect::Subject;
use crate::pipeline::{Step, StepParameters, StepServices};
use crate::profile::{AdminSettings, DatabaseSettings};
use crate::progress::SharedValue;
use crate::shell::{Invocation, escape_sql_string, quote_single};

const DEFAULT_SERVICE_NAME: &str = "MariaDB";

const DEFAULT_TUNING: [(&str, &str); 4] = [
    ("innodb_buffer_pool_size", "1G"),
    ("max_connections", "150"),
    ("query_cache_size", "64M"),
    ("innodb_log_file_size", "256M"),
];

fn mysql_exe(bin_dir: &Path) -> Result<PathBuf> {
    let mysql = bin_dir.join("mysql.exe");
    if !mysql.is_file() {
        bail!("mysql.exe not found at {}", mysql.display());
    }
    Ok(mysql)
}

/// Root connection to the configured server. The password travels in
/// `MYSQL_PWD` so it never appears on a command line.
fn mysql_as_root<I, S>(mysql: &Path, database: &DatabaseSettings, args: I) -> Invocation
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut full_args = vec![
        "-u".to_string(),
        "root".to_string(),
        "-h".to_string(),
        database.host.clone(),
        "-P".to_string(),
        database.port.to_string(),
    ];
    full_args.extend(args.into_iter().map(Into::into));
    Invocation::program(mysql, full_args).with_env("MYSQL_PWD", database.root_password.expose())
}

fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

pub fn provisioning_sql(database: &DatabaseSettings) -> String {
    let db = quote_identifier(&database.name);
    let user = escape_sql_string(&database.user);
    let password = escape_sql_string(database.user_password.expose());
    format!(
        "CREATE DATABASE IF NOT EXISTS {db} CHARACTER SET utf8mb4 COLLATE utf8mb4_unicode_ci;\n\
         CREATE USER IF NOT EXISTS '{user}'@'localhost' IDENTIFIED BY '{password}';\n\
         ALTER USER '{user}'@'localhost' IDENTIFIED BY '{password}';\n\
         GRANT ALL PRIVILEGES ON {db}.* TO '{user}'@'localhost';\n\
         FLUSH PRIVILEGES;"
    )
}

pub fn admin_upsert_sql(table: &str, admin: &AdminSettings, password_hash: &str) -> String {
    format!(
        "INSERT INTO {} (name,email,password,email_verified_at,remember_token,created_at,updated_at) \
         VALUES ('{}','{}','{}',NOW(),NULL,NOW(),NOW()) \
         ON DUPLICATE KEY UPDATE name=VALUES(name), password=VALUES(password), updated_at=NOW();",
        quote_identifier(table),
        escape_sql_string(&admin.name),
        escape_sql_string(&admin.email),
        escape_sql_string(password_hash)
    )
}

pub(crate) struct InstallMariaDb {
    services: StepServices,
    bin_dir: Option<PathBuf>,
    service_name: String,
}

impl InstallMariaDb {
    pub(crate) fn from_params(services: StepServices, mut params: StepParameters) -> Result<Self> {
        Ok(Self {
            services,
            bin_dir: take_string(&mut params, "bin_dir").map(PathBuf::from),
            service_name: take_string(&mut params, "service_name")
                .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string()),
        })
    }

    fn install(&self, ctx: &mut InstallContext) -> Result<()> {
        let installer = require(
            &ctx.facts.archives.mariadb_installer,
            "mariadb_installer",
            "Validate Local Prerequisites",
        )?
        .clone();
        let database = &ctx.settings.database;
        let arguments = [
            "/i".to_string(),
            installer.display().to_string(),
            "/qn".to_string(),
            "/norestart".to_string(),
            format!("SERVICENAME={}", self.service_name),
            "ADDLOCAL=ALL".to_string(),
            "ENABLETCPIP=1".to_string(),
            format!("TCPPORT={}", database.port),
            format!("PASSWORD={}", database.root_password.expose()),
        ]
        .iter()
        .map(|arg| quote_single(arg))
        .collect::<Vec<_>>()
        .join(",");
        let script = format!(
            "$process = Start-Process msiexec.exe -ArgumentList @({arguments}) -Wait -PassThru; \
             if ($process.ExitCode -ne 0) {{ throw \"msiexec exited with $($process.ExitCode)\" }}"
        );
        ctx.log(format!("Installing MariaDB using {}", installer.display()));
        run_script(self.services.shell.as_ref(), "install MariaDB", script)?;
        ctx.log("MariaDB installed successfully");
        Ok(())
    }
}

impl Step for InstallMariaDb {
    fn name(&self) -> &str {
        "Install MariaDB"
    }

    fn run(&self, ctx: &mut InstallContext) -> Result<()> {
        if self.services.policy.requires_action(
            self.services.detector.as_ref(),
            Subject::DatabaseService,
            ctx,
        )? {
            self.install(ctx)?;
        }

        let bin_dir = match &self.bin_dir {
            Some(dir) => dir.clone(),
            None => fsutil::find_mariadb_bin_dir(&fsutil::program_files_roots())
                .ok_or_else(|| anyhow!("could not locate MariaDB bin directory"))?,
        };
        mysql_exe(&bin_dir)?;
        ctx.log(format!("MariaDB binaries located at {}", bin_dir.display()));

        run_script_best_effort(
            self.services.shell.as_ref(),
            ctx,
            "set MariaDB service startup to automatic",
            format!(
                "Get-Service -Name {} -ErrorAction SilentlyContinue | ForEach-Object {{ Set-Service -Name $_.Name -StartupType Automatic }}",
                quote_single(&format!("{}*", self.service_name))
            ),
        );

        ctx.facts.mariadb_bin_dir = Some(bin_dir.clone());
        ctx.publish("mariadb.bin_dir", SharedValue::Path(bin_dir));
        Ok(())
    }
}

pub(crate) struct ConfigureMariaDb {
    services: StepServices,
    tuning: Vec<(String, String)>,
    service_name: String,
}

impl ConfigureMariaDb {
    pub(crate) fn from_params(services: StepServices, mut params: StepParameters) -> Result<Self> {
        Ok(Self {
            services,
            tuning: take_settings(&mut params, "tuning", &DEFAULT_TUNING)?,
            service_name: take_string(&mut params, "service_name")
                .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string()),
        })
    }

    fn tune(&self, ctx: &mut InstallContext, bin_dir: &Path) {
        let Some(config) = fsutil::find_mariadb_config(bin_dir) else {
            ctx.log("Warning: could not locate MariaDB configuration file");
            return;
        };
        let contents = match fs::read_to_string(&config) {
            Ok(contents) => contents,
            Err(err) => {
                ctx.log(format!("Warning: unable to read {}: {err}", config.display()));
                return;
            }
        };
        let mut tuned = contents.clone();
        for (key, value) in &self.tuning {
            tuned = fsutil::set_ini_value(&tuned, key, value);
        }
        if tuned == contents {
            ctx.log(format!("MariaDB configuration at {} already tuned", config.display()));
            return;
        }
        if let Err(err) = fs::write(&config, tuned) {
            ctx.log(format!("Warning: unable to update {}: {err}", config.display()));
            return;
        }
        ctx.log(format!("Updated MariaDB configuration at {}", config.display()));
        run_script_best_effort(
            self.services.shell.as_ref(),
            ctx,
            "restart the MariaDB service",
            format!(
                "Get-Service -Name {} -ErrorAction SilentlyContinue | ForEach-Object {{ Restart-Service -Name $_.Name -Force }}",
                quote_single(&format!("{}*", self.service_name))
            ),
        );
    }
}

impl Step for ConfigureMariaDb {
    fn name(&self) -> &str {
        "Configure MariaDB"
    }

    fn run(&self, ctx: &mut InstallContext) -> Result<()> {
        let bin_dir = require(&ctx.facts.mariadb_bin_dir, "mariadb_bin_dir", "Install MariaDB")?.clone();
        self.tune(ctx, &bin_dir);

        let mysql = mysql_exe(&bin_dir)?;
        let database = ctx.settings.database.clone();
        let sql = provisioning_sql(&database);
        self.services
            .shell
            .execute(&mysql_as_root(&mysql, &database, ["-e".to_string(), sql]))
            .context("Failed to configure database")?;

        ctx.log(format!(
            "Database {} and user {} configured",
            database.name, database.user
        ));
        Ok(())
    }
}

pub(crate) struct SeedDatabase {
    services: StepServices,
    force: bool,
}

impl SeedDatabase {
    pub(crate) fn from_params(services: StepServices, mut params: StepParameters) -> Result<Self> {
        Ok(Self {
            services,
            force: take_bool(&mut params, "force").unwrap_or(false),
        })
    }

    fn table_count(&self, mysql: &Path, database: &DatabaseSettings) -> Result<u64> {
        let query = format!(
            "SELECT COUNT(*) FROM information_schema.tables WHERE table_schema = '{}'",
            escape_sql_string(&database.name)
        );
        let output = self
            .services
            .shell
            .execute(&mysql_as_root(mysql, database, ["-N", "-B", "-e", query.as_str()]))
            .with_context(|| {
                format!(
                    "Could not determine whether database {} is empty",
                    database.name
                )
            })?;
        output.first_line().parse::<u64>().with_context(|| {
            format!(
                "Unexpected table count output for database {}: '{}'",
                database.name,
                output.first_line()
            )
        })
    }
}

impl Step for SeedDatabase {
    fn name(&self) -> &str {
        "Seed Database"
    }

    fn run(&self, ctx: &mut InstallContext) -> Result<()> {
        let bin_dir = require(&ctx.facts.mariadb_bin_dir, "mariadb_bin_dir", "Install MariaDB")?.clone();
        let dump = require(&ctx.facts.sql_dump, "sql_dump", "Resolve Inputs")?.clone();
        if !dump.is_file() {
            bail!("SQL dump not found at {}", dump.display());
        }
        let mysql = mysql_exe(&bin_dir)?;
        let database = ctx.settings.database.clone();

        let tables = self.table_count(&mysql, &database)?;
        ctx.publish("database.tables_before_seed", SharedValue::Count(tables));
        if tables > 0 && !self.force {
            ctx.log(format!(
                "Database {} already contains {tables} table(s); skipping import",
                database.name
            ));
            ctx.publish("database.seeded", SharedValue::Flag(false));
            return Ok(());
        }
        if tables > 0 {
            ctx.log(format!(
                "Database {} contains {tables} table(s); importing anyway (force)",
                database.name
            ));
        }

        ctx.log(format!("Importing SQL dump {}", dump.display()));
        self.services
            .shell
            .execute(&mysql_as_root(&mysql, &database, [database.name.clone()]).with_stdin(&dump))
            .context("mysql import failed")?;
        ctx.log("Database seeded successfully");
        ctx.publish("database.seeded", SharedValue::Flag(true));
        info!(database = database.name.as_str(), "Database seeded");
        Ok(())
    }
}

pub(crate) struct CreateAdminUser {
    services: StepServices,
    table: String,
}

impl CreateAdminUser {
    pub(crate) fn from_params(services: StepServices, mut params: StepParameters) -> Result<Self> {
        Ok(Self {
            services,
            table: take_string(&mut params, "table").unwrap_or_else(|| "users".to_string()),
        })
    }

    fn hash_password(&self, php_exe: &Path, admin: &AdminSettings) -> Result<String> {
        let invocation = Invocation::program(
            php_exe,
            [
                "-r",
                "echo password_hash(getenv('ADMIN_PASSWORD'), PASSWORD_BCRYPT);",
            ],
        )
        .with_env("ADMIN_PASSWORD", admin.password.expose());
        let output = self
            .services
            .shell
            .execute(&invocation)
            .context("Failed to hash admin password")?;
        let hash = output.first_line().to_string();
        if !hash.starts_with("$2y$") {
            bail!("Unexpected password hash output from {}", php_exe.display());
        }
        Ok(hash)
    }
}

impl Step for CreateAdminUser {
    fn name(&self) -> &str {
        "Create Admin User"
    }

    fn run(&self, ctx: &mut InstallContext) -> Result<()> {
        let bin_dir = require(&ctx.facts.mariadb_bin_dir, "mariadb_bin_dir", "Install MariaDB")?.clone();
        let php_exe = require(&ctx.facts.php_exe_path, "php_exe_path", "Install PHP")?.clone();
        let mysql = mysql_exe(&bin_dir)?;
        let database = ctx.settings.database.clone();
        let admin = ctx.settings.admin.clone();

        let hash = self.hash_password(&php_exe, &admin)?;
        let sql = admin_upsert_sql(&self.table, &admin, &hash);
        self.services
            .shell
            .execute(&mysql_as_root(
                &mysql,
                &database,
                [database.name.clone(), "-e".to_string(), sql],
            ))
            .context("Failed to upsert admin user")?;

        ctx.log(format!("Admin user {} created/updated", admin.email));
        ctx.publish("admin.email", SharedValue::Text(admin.email));
        Ok(())
    }
}
