use perkbot_core::broadcast::{BroadcastReport, OutboundMessage, PreviewOutcome};
use serde::Serialize;

pub const CONFIRM_BROADCAST_ACTION: &str = "confirm_broadcast";
pub const CANCEL_BROADCAST_ACTION: &str = "cancel_broadcast";
pub const CONTACT_RH_ACTION: &str = "contact_rh";

/// Failures listed inline on the report card; the rest are summarised.
pub const REPORT_MAX_LISTED_FAILURES: usize = 5;

/// Messages per minute at the default pacing of one send per second.
const SENDS_PER_MINUTE: usize = 60;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TextObject {
    #[serde(rename = "plain_text")]
    Plain { text: String, emoji: bool },
    Mrkdwn { text: String },
}

impl TextObject {
    pub fn plain(text: impl Into<String>) -> Self {
        Self::Plain { text: text.into(), emoji: true }
    }

    pub fn mrkdwn(text: impl Into<String>) -> Self {
        Self::Mrkdwn { text: text.into() }
    }

    pub fn text(&self) -> &str {
        match self {
            Self::Plain { text, .. } | Self::Mrkdwn { text } => text,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ButtonStyle {
    Primary,
    Danger,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename = "button")]
pub struct ButtonElement {
    pub action_id: String,
    pub text: TextObject,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub style: Option<ButtonStyle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl ButtonElement {
    pub fn new(action_id: impl Into<String>, label: impl Into<String>) -> Self {
        Self { action_id: action_id.into(), text: TextObject::plain(label), style: None, value: None }
    }

    pub fn style(mut self, style: ButtonStyle) -> Self {
        self.style = Some(style);
        self
    }

    pub fn value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    Header {
        text: TextObject,
    },
    Section {
        block_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<TextObject>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        fields: Vec<TextObject>,
    },
    Divider,
    Actions {
        block_id: String,
        elements: Vec<ButtonElement>,
    },
    Context {
        block_id: String,
        elements: Vec<TextObject>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MessageTemplate {
    pub fallback_text: String,
    pub blocks: Vec<Block>,
}

impl MessageTemplate {
    /// Converts into the transport-neutral message the sender delivers.
    pub fn to_outbound(&self) -> OutboundMessage {
        let blocks =
            self.blocks.iter().filter_map(|block| serde_json::to_value(block).ok()).collect();
        OutboundMessage::text(self.fallback_text.clone()).with_blocks(blocks)
    }

    /// Concatenated text of every block, handy for assertions and logs.
    pub fn plain_text(&self) -> String {
        let mut parts = vec![self.fallback_text.clone()];
        for block in &self.blocks {
            match block {
                Block::Header { text } => parts.push(text.text().to_owned()),
                Block::Section { text, fields, .. } => {
                    parts.extend(text.iter().map(|text| text.text().to_owned()));
                    parts.extend(fields.iter().map(|field| field.text().to_owned()));
                }
                Block::Context { elements, .. } => {
                    parts.extend(elements.iter().map(|element| element.text().to_owned()));
                }
                Block::Actions { elements, .. } => {
                    parts.extend(elements.iter().map(|button| button.text.text().to_owned()));
                }
                Block::Divider => {}
            }
        }
        parts.join("\n")
    }
}

pub struct MessageBuilder {
    fallback_text: String,
    blocks: Vec<Block>,
}

impl MessageBuilder {
    pub fn new(fallback_text: impl Into<String>) -> Self {
        Self { fallback_text: fallback_text.into(), blocks: Vec::new() }
    }

    pub fn header(mut self, text: impl Into<String>) -> Self {
        self.blocks.push(Block::Header { text: TextObject::plain(text) });
        self
    }

    pub fn divider(mut self) -> Self {
        self.blocks.push(Block::Divider);
        self
    }

    pub fn section<F>(mut self, block_id: impl Into<String>, build: F) -> Self
    where
        F: FnOnce(&mut SectionBuilder),
    {
        let mut builder = SectionBuilder::default();
        build(&mut builder);
        let (text, fields) = builder.build();
        self.blocks.push(Block::Section { block_id: block_id.into(), text, fields });
        self
    }

    pub fn actions<F>(mut self, block_id: impl Into<String>, build: F) -> Self
    where
        F: FnOnce(&mut ActionsBuilder),
    {
        let mut builder = ActionsBuilder::default();
        build(&mut builder);
        self.blocks.push(Block::Actions { block_id: block_id.into(), elements: builder.build() });
        self
    }

    pub fn context<F>(mut self, block_id: impl Into<String>, build: F) -> Self
    where
        F: FnOnce(&mut ContextBuilder),
    {
        let mut builder = ContextBuilder::default();
        build(&mut builder);
        self.blocks.push(Block::Context { block_id: block_id.into(), elements: builder.build() });
        self
    }

    pub fn build(self) -> MessageTemplate {
        MessageTemplate { fallback_text: self.fallback_text, blocks: self.blocks }
    }
}

#[derive(Default)]
pub struct SectionBuilder {
    text: Option<TextObject>,
    fields: Vec<TextObject>,
}

impl SectionBuilder {
    pub fn plain(&mut self, text: impl Into<String>) -> &mut Self {
        self.text = Some(TextObject::plain(text));
        self
    }

    pub fn mrkdwn(&mut self, text: impl Into<String>) -> &mut Self {
        self.text = Some(TextObject::mrkdwn(text));
        self
    }

    pub fn field(&mut self, text: impl Into<String>) -> &mut Self {
        self.fields.push(TextObject::mrkdwn(text));
        self
    }

    fn build(self) -> (Option<TextObject>, Vec<TextObject>) {
        let text = match (self.text, self.fields.is_empty()) {
            (Some(text), _) => Some(text),
            (None, true) => Some(TextObject::plain("")),
            (None, false) => None,
        };
        (text, self.fields)
    }
}

#[derive(Default)]
pub struct ActionsBuilder {
    elements: Vec<ButtonElement>,
}

impl ActionsBuilder {
    pub fn button(&mut self, button: ButtonElement) -> &mut Self {
        self.elements.push(button);
        self
    }

    fn build(self) -> Vec<ButtonElement> {
        self.elements
    }
}

#[derive(Default)]
pub struct ContextBuilder {
    elements: Vec<TextObject>,
}

impl ContextBuilder {
    pub fn plain(&mut self, text: impl Into<String>) -> &mut Self {
        self.elements.push(TextObject::plain(text));
        self
    }

    pub fn mrkdwn(&mut self, text: impl Into<String>) -> &mut Self {
        self.elements.push(TextObject::mrkdwn(text));
        self
    }

    fn build(self) -> Vec<TextObject> {
        self.elements
    }
}

/// Whole minutes a run of `recipients` sends takes at one send per second.
pub fn estimated_minutes(recipients: usize) -> usize {
    recipients.div_ceil(SENDS_PER_MINUTE)
}

pub fn broadcast_preview_message(channel_id: &str, outcome: &PreviewOutcome) -> MessageTemplate {
    let degraded = outcome.is_degraded();
    let preview = outcome.clone().into_preview();
    let eligible = preview.eligible_count();

    let channel_line = if degraded {
        format!(
            "*Análise do canal <#{channel_id}>:*\n\n:warning: *Não foi possível listar membros do canal.*\nVerifique se o bot tem as permissões necessárias (`channels:read`, `groups:read`, `users:read`)."
        )
    } else {
        format!("*Análise do canal <#{channel_id}>:*")
    };
    let total = if degraded { "N/D".to_owned() } else { preview.total_members.to_string() };
    let summary = if eligible > 0 {
        format!(
            ":warning: *{eligible} pessoas* receberão uma mensagem direta do bot.\n\n*Importante:*\n• Envio controlado: 1 mensagem/segundo\n• Tempo estimado: ~{} minuto(s)\n• Não envia para bots, contas desativadas ou quem já recebeu\n• Falhas individuais são registradas e o envio continua",
            estimated_minutes(eligible)
        )
    } else if degraded {
        ":warning: *Não foi possível analisar o canal.*\nVerifique as permissões do bot antes de confirmar.".to_owned()
    } else {
        ":white_check_mark: *Nenhuma mensagem será enviada.*\n\nTodos os membros ativos já receberam a mensagem ou são bots.".to_owned()
    };

    let builder = MessageBuilder::new(format!("Prévia: {eligible} pessoas vão receber DM"))
        .header(":bar_chart: Prévia do Broadcast")
        .section("broadcast.preview.channel.v1", |section| {
            section.mrkdwn(channel_line);
        })
        .section("broadcast.preview.counts.v1", |section| {
            section
                .field(format!(":busts_in_silhouette: *Total de membros:*\n{total}"))
                .field(format!(":robot_face: *Bots (serão ignorados):*\n{}", preview.bot_count))
                .field(format!(":no_entry_sign: *Contas desativadas:*\n{}", preview.deactivated_count))
                .field(format!(":white_check_mark: *Já receberam (cache):*\n{}", preview.already_notified_count))
                .field(format!(":incoming_envelope: *Vão receber DM:*\n{eligible}"));
        })
        .divider()
        .section("broadcast.preview.summary.v1", |section| {
            section.mrkdwn(summary);
        });

    if degraded {
        return builder.build();
    }

    builder
        .actions("broadcast.preview.actions.v1", |actions| {
            actions
                .button(
                    ButtonElement::new(CONFIRM_BROADCAST_ACTION, "Sim, enviar")
                        .style(ButtonStyle::Primary)
                        .value(channel_id),
                )
                .button(
                    ButtonElement::new(CANCEL_BROADCAST_ACTION, "Não, cancelar")
                        .style(ButtonStyle::Danger)
                        .value(channel_id),
                );
        })
        .context("broadcast.preview.context.v1", |context| {
            context.mrkdwn("_Esta ação não pode ser desfeita. Confirme antes de enviar._");
        })
        .build()
}

pub fn broadcast_started_message() -> MessageTemplate {
    MessageBuilder::new("Iniciando broadcast... Isso pode levar alguns minutos.")
        .section("broadcast.started.v1", |section| {
            section.mrkdwn(":hourglass_flowing_sand: *Broadcast em andamento...*\n\nPor favor, aguarde. Você receberá uma mensagem direta quando concluir.");
        })
        .build()
}

pub fn broadcast_nothing_to_send_message() -> MessageTemplate {
    MessageBuilder::new("Nenhuma mensagem precisa ser enviada.")
        .section("broadcast.nothing_to_send.v1", |section| {
            section.mrkdwn(":white_check_mark: *Nenhuma mensagem precisa ser enviada.*\nTodos os membros ativos já foram notificados.");
        })
        .build()
}

pub fn broadcast_cancelled_message() -> MessageTemplate {
    MessageBuilder::new("Broadcast cancelado. Nenhuma mensagem foi enviada.")
        .section("broadcast.cancelled.v1", |section| {
            section.mrkdwn(":x: Broadcast cancelado. Nenhuma mensagem foi enviada.");
        })
        .build()
}

pub fn broadcast_cancelling_message() -> MessageTemplate {
    MessageBuilder::new("Cancelando broadcast em andamento.")
        .section("broadcast.cancelling.v1", |section| {
            section.mrkdwn(":octagonal_sign: *Cancelando broadcast...*\nNenhuma nova mensagem será enviada. O relatório parcial chegará por mensagem direta.");
        })
        .build()
}

pub fn broadcast_report_message(report: &BroadcastReport) -> MessageTemplate {
    let title = if report.was_cancelled() {
        ":octagonal_sign: Broadcast Interrompido"
    } else {
        ":white_check_mark: Broadcast Concluído!"
    };

    let fallback = if report.was_cancelled() {
        format!(
            "Broadcast interrompido: {} enviadas, {} não tentadas",
            report.succeeded, report.cancelled
        )
    } else {
        format!("Broadcast concluído: {} enviadas, {} falharam", report.succeeded, report.failed)
    };

    let mut builder = MessageBuilder::new(fallback)
    .header(title)
    .section("broadcast.report.counts.v1", |section| {
        section
            .field(format!(":incoming_envelope: *Enviadas:*\n{}", report.succeeded))
            .field(format!(":black_right_pointing_double_triangle_with_vertical_bar: *Puladas:*\n{}", report.skipped))
            .field(format!(":x: *Falharam:*\n{}", report.failed))
            .field(format!(":bar_chart: *Taxa de sucesso:*\n{:.1}%", report.success_rate()));
        if report.was_cancelled() {
            section.field(format!(":octagonal_sign: *Não tentadas:*\n{}", report.cancelled));
        }
    });

    if !report.failures.is_empty() {
        let listed = report
            .failures
            .iter()
            .take(REPORT_MAX_LISTED_FAILURES)
            .map(|failure| format!("• <@{}>: {}", failure.recipient_id, failure.error))
            .collect::<Vec<_>>()
            .join("\n");
        let remaining = report.failures.len().saturating_sub(REPORT_MAX_LISTED_FAILURES);
        let tail =
            if remaining > 0 { format!("\n_...e mais {remaining} erros_") } else { String::new() };

        builder = builder.section("broadcast.report.failures.v1", |section| {
            section.mrkdwn(format!(
                ":warning: *Erros encontrados ({}):*\n{listed}{tail}",
                report.failures.len()
            ));
        });
    }

    builder
        .context("broadcast.report.context.v1", |context| {
            context.mrkdwn(format!("_{} destinatários processados_", report.total));
        })
        .build()
}

pub fn welcome_message(user_id: &str) -> MessageTemplate {
    MessageBuilder::new("Bem-vindo(a)! Você tem acesso a diversos benefícios.")
        .header(":tada: Bem-vindo(a) ao time!")
        .section("welcome.greeting.v1", |section| {
            section.mrkdwn(format!(
                "Olá <@{user_id}>! Seja muito bem-vindo(a)! :star2:\n\nA partir de agora *você já tem acesso a uma série de benefícios* que vão facilitar seu dia a dia e cuidar do seu bem-estar."
            ));
        })
        .divider()
        .section("welcome.next_steps.v1", |section| {
            section.mrkdwn("Use `/beneficios` para ver a lista completa ou fale com o RH/DP se tiver dúvidas.");
        })
        .actions("welcome.actions.v1", |actions| {
            actions.button(ButtonElement::new(CONTACT_RH_ACTION, ":speech_balloon: Falar com RH/DP"));
        })
        .build()
}

/// Sent to the HR contact when a member asks to be contacted.
pub fn contact_rh_request_message(requester_id: &str) -> MessageTemplate {
    MessageBuilder::new(format!(
        ":wave: Olá! O usuário <@{requester_id}> clicou em *Falar com RH/DP* no bot de benefícios e solicitou contato."
    ))
    .section("contact_rh.request.v1", |section| {
        section.mrkdwn(format!(
            ":wave: *Nova solicitação de contato*\n\nO usuário <@{requester_id}> clicou no botão *Falar com RH/DP* no bot de benefícios e solicitou contato."
        ));
    })
    .build()
}

pub fn contact_rh_confirmed_message() -> MessageTemplate {
    single_section(
        "contact_rh.confirmed.v1",
        ":white_check_mark: Pronto! O RH/DP já foi notificado e entrará em contato com você em breve.",
    )
}

pub fn contact_rh_unconfigured_message() -> MessageTemplate {
    single_section(
        "contact_rh.unconfigured.v1",
        ":x: Contato do RH/DP não está configurado. Fale com o administrador do bot.",
    )
}

fn single_section(block_id: &str, text: &str) -> MessageTemplate {
    MessageBuilder::new(text.to_owned())
        .section(block_id, |section| {
            section.mrkdwn(text.to_owned());
        })
        .build()
}

pub fn error_message(summary: &str, correlation_id: &str) -> MessageTemplate {
    MessageBuilder::new(summary.to_owned())
        .section("broadcast.error.summary.v1", |section| {
            section.mrkdwn(format!(":warning: {summary}"));
        })
        .context("broadcast.error.context.v1", |context| {
            context.plain(format!("ID de correlação: {correlation_id}"));
        })
        .build()
}

pub fn help_message() -> MessageTemplate {
    MessageBuilder::new("Broadcast command help")
        .section("broadcast.help.summary.v1", |section| {
            section.mrkdwn(
                "*Comandos disponíveis*\n• `/beneficios-broadcast-preview` mostra quem receberá a mensagem de boas-vindas e pede confirmação\n• `/beneficios-broadcast-preview help` mostra esta ajuda",
            );
        })
        .build()
}
